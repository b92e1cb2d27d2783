//! Vertex color model: materials, lighting, and stylized post effects.
//!
//! The closed-form shading here is evaluated verbatim on the CPU and
//! regenerated as WGSL for the GPU color pass, keeping live-edit previews
//! and exported colors identical. Missing sections degrade to a flat
//! gray fill; meshing never depends on this module succeeding.
//!
//! Author: Moroya Sakamoto

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use super::SceneProgram;

/// Base color fallback when no material matches (flat gray).
pub const DEFAULT_BASE_COLOR: Vec3 = Vec3::new(0.8, 0.8, 0.8);

/// One entry of the scene `materials` section.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Material {
    /// Id matched against `material` tags in the distance expression.
    pub id: u32,
    /// Linear RGB base color.
    pub base_color: [f32; 3],
}

fn default_light_dir() -> [f32; 3] {
    [1.0, 2.0, 1.0]
}

fn default_camera_pos() -> [f32; 3] {
    [0.0, 2.0, 5.0]
}

fn default_ambient() -> f32 {
    0.15
}

fn default_true() -> bool {
    true
}

fn default_shininess() -> f32 {
    16.0
}

/// The scene `color` section: lighting terms plus stylized post effects.
///
/// Every term is optional-by-default so a minimal section still shades;
/// an absent section entirely skips shading (flat gray fill instead).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ColorSpec {
    /// Light direction (normalized at use).
    pub light_dir: [f32; 3],
    /// Camera position for rim/specular view vectors.
    pub camera_pos: [f32; 3],
    /// Ambient floor.
    pub ambient: f32,
    /// Raymarched soft shadow attenuation on the diffuse term.
    pub soft_shadow: bool,
    /// Five-tap ambient occlusion along the normal.
    pub ambient_occlusion: bool,
    /// Rim light strength (0 disables).
    pub rim: f32,
    /// Specular strength (0 disables).
    pub specular: f32,
    /// Specular exponent.
    pub shininess: f32,
    /// Posterize color levels (0 or 1 disables).
    pub posterize_levels: u32,
    /// Brush-stroke fbm modulation scale (0 disables).
    pub brush_scale: f32,
    /// Edge darkening strength driven by occlusion (0 disables).
    pub edge_darken: f32,
}

impl Default for ColorSpec {
    fn default() -> Self {
        ColorSpec {
            light_dir: default_light_dir(),
            camera_pos: default_camera_pos(),
            ambient: default_ambient(),
            soft_shadow: default_true(),
            ambient_occlusion: default_true(),
            rim: 0.0,
            specular: 0.0,
            shininess: default_shininess(),
            posterize_levels: 0,
            brush_scale: 0.0,
            edge_darken: 0.0,
        }
    }
}

// ── Procedural noise (identical constants in the generated WGSL) ────

/// GLSL-style fract (always in `[0, 1)`), matching WGSL `fract`.
#[inline(always)]
fn gfract(x: f32) -> f32 {
    x - x.floor()
}

/// 2D hash, the classic sin-dot fract construction.
#[inline(always)]
pub fn hash2(p: Vec2) -> f32 {
    let h = p.dot(Vec2::new(127.1, 311.7));
    gfract(h.sin() * 43758.5453)
}

/// Value noise over the hash lattice with smoothstep interpolation.
#[inline(always)]
pub fn noise2(p: Vec2) -> f32 {
    let i = p.floor();
    let f = p - i;
    let u = f * f * (Vec2::splat(3.0) - 2.0 * f);

    let a = hash2(i);
    let b = hash2(i + Vec2::new(1.0, 0.0));
    let c = hash2(i + Vec2::new(0.0, 1.0));
    let d = hash2(i + Vec2::new(1.0, 1.0));

    a + (b - a) * u.x + (c - a) * u.y + (a - b - c + d) * u.x * u.y
}

/// Three-octave fractal noise.
#[inline(always)]
pub fn fbm2(mut p: Vec2) -> f32 {
    let mut value = 0.0;
    let mut amplitude = 0.5;
    for _ in 0..3 {
        value += amplitude * noise2(p);
        p *= 2.0;
        amplitude *= 0.5;
    }
    value
}

/// Quantize a color to `levels` bands per channel.
#[inline(always)]
pub fn posterize(c: Vec3, levels: u32) -> Vec3 {
    if levels < 2 {
        return c;
    }
    let l = levels as f32;
    (c * l).floor() / l
}

/// Triplanar UV for the brush-stroke texture, dominant-axis projection.
#[inline(always)]
fn triplanar_uv(p: Vec3, n: Vec3) -> Vec2 {
    let abs_n = n.abs();
    if abs_n.x >= abs_n.y && abs_n.x >= abs_n.z {
        Vec2::new(p.y, p.z)
    } else if abs_n.y >= abs_n.z {
        Vec2::new(p.x, p.z)
    } else {
        Vec2::new(p.x, p.y)
    }
}

// ── Lighting terms ──────────────────────────────────────────────────

/// Raymarched soft shadow: `k·h/t` penumbra attenuation toward the light.
fn soft_shadow(program: &SceneProgram, origin: Vec3, light: Vec3) -> f32 {
    const K: f32 = 16.0;
    const MAX_T: f32 = 10.0;

    let mut res: f32 = 1.0;
    let mut t: f32 = 0.02;
    for _ in 0..32 {
        let h = program.distance.eval(origin + light * t);
        res = res.min(K * h / t);
        if res < 0.001 || t > MAX_T {
            break;
        }
        t += h.clamp(0.01, 0.5);
    }
    res.clamp(0.0, 1.0)
}

/// Five-tap occlusion along the normal with decaying weights.
fn ambient_occlusion(program: &SceneProgram, p: Vec3, n: Vec3) -> f32 {
    let mut occ = 0.0;
    let mut sca = 1.0;
    for i in 0..5 {
        let h = 0.01 + 0.12 * i as f32 / 4.0;
        let d = program.distance.eval(p + n * h);
        occ += (h - d) * sca;
        sca *= 0.95;
    }
    (1.0 - 3.0 * occ).clamp(0.0, 1.0)
}

/// Shade one vertex of a generated mesh.
///
/// Term order: material base, diffuse with shadow attenuation, ambient
/// with occlusion, specular, rim, then posterize / brush / edge-darken
/// post effects. Matches the generated GPU color pass term for term.
pub fn shade_vertex(program: &SceneProgram, p: Vec3, n: Vec3, time: f32) -> Vec3 {
    let spec = match &program.color {
        Some(spec) => spec,
        None => return DEFAULT_BASE_COLOR,
    };

    let (_, mat_id) = program.distance.eval_material(p);
    let base = program.material_color(mat_id);

    let l = Vec3::from(spec.light_dir).normalize_or_zero();
    let v = (Vec3::from(spec.camera_pos) - p).normalize_or_zero();

    let diff = n.dot(l).max(0.0);
    let shadow = if spec.soft_shadow {
        soft_shadow(program, p + n * 0.02, l)
    } else {
        1.0
    };
    let ao = if spec.ambient_occlusion {
        ambient_occlusion(program, p, n)
    } else {
        1.0
    };

    let mut col = base * (spec.ambient * ao + diff * shadow);

    if spec.specular > 0.0 {
        let r = (2.0 * n.dot(l) * n - l).normalize_or_zero();
        col += Vec3::splat(spec.specular * r.dot(v).max(0.0).powf(spec.shininess) * shadow);
    }

    if spec.rim > 0.0 {
        let fresnel = (1.0 - n.dot(v).max(0.0)).powf(3.0);
        col += Vec3::splat(spec.rim * fresnel);
    }

    col = posterize(col, spec.posterize_levels);

    if spec.brush_scale > 0.0 {
        let uv = triplanar_uv(p, n) * spec.brush_scale + Vec2::splat(time * 0.05);
        let stroke = fbm2(uv);
        col *= 0.85 + 0.3 * stroke;
    }

    if spec.edge_darken > 0.0 {
        col *= 1.0 - spec.edge_darken * (1.0 - ao);
    }

    col.clamp(Vec3::ZERO, Vec3::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneProgram;

    fn sphere_program(color: Option<ColorSpec>) -> SceneProgram {
        let doc = r#"{"distance": {"sphere": {"radius": 1.0}}}"#;
        let mut program = SceneProgram::build(doc).unwrap();
        program.color = color;
        program
    }

    #[test]
    fn test_flat_gray_without_color_section() {
        let program = sphere_program(None);
        let c = shade_vertex(&program, Vec3::X, Vec3::X, 0.0);
        assert_eq!(c, DEFAULT_BASE_COLOR);
    }

    #[test]
    fn test_lit_side_brighter_than_dark_side() {
        let program = sphere_program(Some(ColorSpec::default()));
        let l = Vec3::new(1.0, 2.0, 1.0).normalize();
        let lit = shade_vertex(&program, l, l, 0.0);
        let dark = shade_vertex(&program, -l, -l, 0.0);
        assert!(lit.length() > dark.length());
    }

    #[test]
    fn test_colors_clamped() {
        let spec = ColorSpec {
            specular: 10.0,
            rim: 10.0,
            ..Default::default()
        };
        let program = sphere_program(Some(spec));
        let c = shade_vertex(&program, Vec3::Y, Vec3::Y, 0.0);
        assert!(c.max_element() <= 1.0 && c.min_element() >= 0.0);
    }

    #[test]
    fn test_posterize_quantizes() {
        let c = posterize(Vec3::new(0.34, 0.56, 0.99), 4);
        assert_eq!(c, Vec3::new(0.25, 0.5, 0.75));
        // Disabled below 2 levels
        assert_eq!(posterize(Vec3::splat(0.37), 0), Vec3::splat(0.37));
    }

    #[test]
    fn test_noise_range() {
        for i in 0..50 {
            let p = Vec2::new(i as f32 * 0.37, i as f32 * 0.61);
            let n = noise2(p);
            assert!((0.0..=1.0).contains(&n), "noise2 out of range: {}", n);
            let f = fbm2(p);
            assert!((0.0..1.0).contains(&f), "fbm2 out of range: {}", f);
        }
    }

    #[test]
    fn test_shading_deterministic() {
        let program = sphere_program(Some(ColorSpec {
            brush_scale: 2.0,
            posterize_levels: 6,
            ..Default::default()
        }));
        let a = shade_vertex(&program, Vec3::Y, Vec3::Y, 1.5);
        let b = shade_vertex(&program, Vec3::Y, Vec3::Y, 1.5);
        assert_eq!(a, b);
    }
}
