//! Scene Program Builder: structured scene documents to immutable programs.
//!
//! A scene arrives as a JSON document with `library`, `distance`,
//! `materials`, and `color` sections. Building resolves library
//! references, validates every numeric parameter, and produces an
//! immutable [`SceneProgram`] — or a [`SceneBuildError`]; no partially
//! built program is ever observable. Programs are cached by a crc32 of
//! the source text, so unchanged sources are an O(1) lookup with no
//! side effects.
//!
//! Author: Moroya Sakamoto

pub mod color;
mod expr;

pub use color::{ColorSpec, Material, DEFAULT_BASE_COLOR};
pub use expr::SdfExpr;
pub(crate) use expr::FOLD_EPSILON;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use glam::Vec3;
use serde::Deserialize;
use thiserror::Error;

/// Why a scene document could not be built into a program.
#[derive(Debug, Error)]
pub enum SceneBuildError {
    /// The document is not valid JSON for the scene schema.
    #[error("malformed scene document: {0}")]
    Parse(String),

    /// A `ref` names a library entry that does not exist.
    #[error("unresolved reference `{0}`")]
    UnresolvedRef(String),

    /// Library references form a cycle.
    #[error("circular reference through `{0}`")]
    CircularRef(String),

    /// A numeric parameter is unusable (non-finite, zero scale, ...).
    #[error("invalid parameter in `{fragment}`: {reason}")]
    InvalidParameter {
        /// The offending node, rendered for diagnostics.
        fragment: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Raw document shape; sections other than `distance` are optional.
#[derive(Debug, Deserialize)]
struct SceneDoc {
    #[serde(default)]
    library: HashMap<String, SdfExpr>,
    distance: SdfExpr,
    #[serde(default)]
    materials: Vec<Material>,
    #[serde(default)]
    color: Option<ColorSpec>,
}

/// Immutable, validated scene program.
///
/// `distance` has all library references resolved away and is the single
/// source of truth for geometry: the CPU engine interprets it, the GPU
/// path transpiles it, and the color pass derives its material and
/// shadow queries from the same tree.
#[derive(Debug, Clone)]
pub struct SceneProgram {
    /// Resolved distance expression.
    pub distance: SdfExpr,
    /// Material id to base color, from the `materials` section.
    pub materials: HashMap<u32, Vec3>,
    /// Color/lighting spec; `None` means flat gray fill, no shading.
    pub color: Option<ColorSpec>,
    /// crc32 of the source text this program was built from.
    pub source_hash: u64,
}

impl SceneProgram {
    /// Build a program from scene source text.
    pub fn build(source: &str) -> Result<SceneProgram, SceneBuildError> {
        let source_hash = hash_source(source);
        let doc: SceneDoc =
            serde_json::from_str(source).map_err(|e| SceneBuildError::Parse(e.to_string()))?;

        let mut distance = resolve_refs(&doc.distance, &doc.library, &mut Vec::new())?;
        validate_expr(&distance)?;
        normalize_directions(&mut distance);

        let mut materials = HashMap::new();
        for m in &doc.materials {
            let c = m.base_color;
            if !c.iter().all(|v| v.is_finite()) {
                return Err(SceneBuildError::InvalidParameter {
                    fragment: format!("material {}", m.id),
                    reason: "base_color must be finite".to_string(),
                });
            }
            materials.insert(m.id, Vec3::from(c));
        }

        if let Some(spec) = &doc.color {
            validate_color(spec)?;
        }

        Ok(SceneProgram {
            distance,
            materials,
            color: doc.color,
            source_hash,
        })
    }

    /// Base color for a material id; untagged or unknown ids shade gray.
    #[inline]
    pub fn material_color(&self, id: u32) -> Vec3 {
        self.materials.get(&id).copied().unwrap_or(DEFAULT_BASE_COLOR)
    }
}

/// Hash scene source text the way the cache keys it.
pub fn hash_source(source: &str) -> u64 {
    crc32fast::hash(source.as_bytes()) as u64
}

/// Replace every `Ref` with its library definition, depth-first,
/// detecting cycles by the path of names currently being expanded.
fn resolve_refs(
    expr: &SdfExpr,
    library: &HashMap<String, SdfExpr>,
    in_flight: &mut Vec<String>,
) -> Result<SdfExpr, SceneBuildError> {
    let resolve_items = |items: &[SdfExpr], in_flight: &mut Vec<String>| {
        items
            .iter()
            .map(|e| resolve_refs(e, library, in_flight))
            .collect::<Result<Vec<_>, _>>()
    };

    Ok(match expr {
        SdfExpr::Ref(name) => {
            if in_flight.iter().any(|n| n == name) {
                return Err(SceneBuildError::CircularRef(name.clone()));
            }
            let target = library
                .get(name)
                .ok_or_else(|| SceneBuildError::UnresolvedRef(name.clone()))?;
            in_flight.push(name.clone());
            let resolved = resolve_refs(target, library, in_flight)?;
            in_flight.pop();
            resolved
        }

        SdfExpr::Union(items) => SdfExpr::Union(resolve_items(items, in_flight)?),
        SdfExpr::Intersect(items) => SdfExpr::Intersect(resolve_items(items, in_flight)?),
        SdfExpr::Subtract(items) => SdfExpr::Subtract(resolve_items(items, in_flight)?),
        SdfExpr::SmoothUnion { k, items } => SdfExpr::SmoothUnion {
            k: *k,
            items: resolve_items(items, in_flight)?,
        },
        SdfExpr::SmoothIntersect { k, items } => SdfExpr::SmoothIntersect {
            k: *k,
            items: resolve_items(items, in_flight)?,
        },
        SdfExpr::SmoothSubtract { k, items } => SdfExpr::SmoothSubtract {
            k: *k,
            items: resolve_items(items, in_flight)?,
        },

        SdfExpr::Translate { offset, child } => SdfExpr::Translate {
            offset: *offset,
            child: Box::new(resolve_refs(child, library, in_flight)?),
        },
        SdfExpr::Rotate { axis, angle, child } => SdfExpr::Rotate {
            axis: *axis,
            angle: *angle,
            child: Box::new(resolve_refs(child, library, in_flight)?),
        },
        SdfExpr::Scale { factor, child } => SdfExpr::Scale {
            factor: *factor,
            child: Box::new(resolve_refs(child, library, in_flight)?),
        },
        SdfExpr::Round { radius, child } => SdfExpr::Round {
            radius: *radius,
            child: Box::new(resolve_refs(child, library, in_flight)?),
        },
        SdfExpr::Onion { thickness, child } => SdfExpr::Onion {
            thickness: *thickness,
            child: Box::new(resolve_refs(child, library, in_flight)?),
        },
        SdfExpr::Material { id, child } => SdfExpr::Material {
            id: *id,
            child: Box::new(resolve_refs(child, library, in_flight)?),
        },

        leaf => leaf.clone(),
    })
}

fn invalid(expr: &SdfExpr, reason: &str) -> SceneBuildError {
    let fragment = serde_json::to_string(expr).unwrap_or_else(|_| format!("{:?}", expr));
    SceneBuildError::InvalidParameter {
        fragment,
        reason: reason.to_string(),
    }
}

/// Reject non-finite and degenerate parameters anywhere in the tree.
fn validate_expr(root: &SdfExpr) -> Result<(), SceneBuildError> {
    let mut error = None;
    root.for_each(&mut |node| {
        if error.is_some() {
            return;
        }
        let finite = |vals: &[f32]| vals.iter().all(|v| v.is_finite());
        let bad = match node {
            SdfExpr::Sphere { radius } => !radius.is_finite() || *radius <= 0.0,
            SdfExpr::Box3 { half_extents } => {
                !finite(half_extents) || half_extents.iter().any(|&h| h <= 0.0)
            }
            SdfExpr::RoundBox { half_extents, radius } => {
                !finite(half_extents)
                    || half_extents.iter().any(|&h| h <= 0.0)
                    || !radius.is_finite()
                    || *radius < 0.0
            }
            SdfExpr::Cylinder { radius, half_height } => {
                !finite(&[*radius, *half_height]) || *radius <= 0.0 || *half_height <= 0.0
            }
            SdfExpr::Torus { major_radius, minor_radius } => {
                !finite(&[*major_radius, *minor_radius])
                    || *major_radius <= 0.0
                    || *minor_radius <= 0.0
            }
            SdfExpr::Plane { normal, offset } => {
                !finite(normal)
                    || !offset.is_finite()
                    || Vec3::from(*normal).length_squared() < 1e-12
            }
            SdfExpr::Capsule { a, b, radius } => {
                !finite(a)
                    || !finite(b)
                    || !radius.is_finite()
                    || *radius <= 0.0
                    || Vec3::from(*a) == Vec3::from(*b)
            }
            SdfExpr::Union(items)
            | SdfExpr::Intersect(items)
            | SdfExpr::Subtract(items) => items.is_empty(),
            SdfExpr::SmoothUnion { k, items }
            | SdfExpr::SmoothIntersect { k, items }
            | SdfExpr::SmoothSubtract { k, items } => {
                items.is_empty() || !k.is_finite() || *k < 0.0
            }
            SdfExpr::Translate { offset, child: _ } => !finite(offset),
            SdfExpr::Rotate { axis, angle, child: _ } => {
                !finite(axis)
                    || !angle.is_finite()
                    || Vec3::from(*axis).length_squared() < 1e-12
            }
            SdfExpr::Scale { factor, child: _ } => !factor.is_finite() || *factor <= 0.0,
            SdfExpr::Round { radius, child: _ } => !radius.is_finite() || *radius < 0.0,
            SdfExpr::Onion { thickness, child: _ } => {
                !thickness.is_finite() || *thickness <= 0.0
            }
            SdfExpr::Material { .. } => false,
            SdfExpr::Ref(_) => true, // refs must be resolved before validation
        };
        if bad {
            error = Some(invalid(node, "non-finite or degenerate parameter"));
        }
    });
    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Normalize rotation axes and plane normals once, after validation has
/// rejected near-zero vectors. Both eval paths and the WGSL transpiler
/// then see unit directions, and plane distances stay metric.
fn normalize_directions(root: &mut SdfExpr) {
    root.for_each_mut(&mut |node| match node {
        SdfExpr::Rotate { axis, .. } => {
            *axis = Vec3::from(*axis).normalize_or_zero().to_array();
        }
        SdfExpr::Plane { normal, .. } => {
            *normal = Vec3::from(*normal).normalize_or_zero().to_array();
        }
        _ => {}
    });
}

fn validate_color(spec: &ColorSpec) -> Result<(), SceneBuildError> {
    let fields = [
        spec.light_dir[0],
        spec.light_dir[1],
        spec.light_dir[2],
        spec.camera_pos[0],
        spec.camera_pos[1],
        spec.camera_pos[2],
        spec.ambient,
        spec.rim,
        spec.specular,
        spec.shininess,
        spec.brush_scale,
        spec.edge_darken,
    ];
    if !fields.iter().all(|v| v.is_finite()) {
        return Err(SceneBuildError::InvalidParameter {
            fragment: "color".to_string(),
            reason: "color section fields must be finite".to_string(),
        });
    }
    if Vec3::from(spec.light_dir).length_squared() < 1e-12 {
        return Err(SceneBuildError::InvalidParameter {
            fragment: "color".to_string(),
            reason: "light_dir must be non-zero".to_string(),
        });
    }
    Ok(())
}

/// Thread-safe program cache keyed by source hash.
///
/// Any change in the source text changes the hash and triggers a rebuild
/// before the next use; extractions already in flight keep their `Arc`
/// to the old program, so a program never changes mid-extraction.
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: RwLock<HashMap<u64, Arc<SceneProgram>>>,
}

impl ProgramCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        ProgramCache::default()
    }

    /// Fetch the program for `source`, building it on first sight.
    ///
    /// Hits are O(1) and side-effect-free. Build failures are not cached;
    /// a corrected source with a new hash builds fresh.
    pub fn get_or_build(&self, source: &str) -> Result<Arc<SceneProgram>, SceneBuildError> {
        let hash = hash_source(source);

        if let Ok(cache) = self.programs.read() {
            if let Some(program) = cache.get(&hash) {
                return Ok(Arc::clone(program));
            }
        }

        let program = Arc::new(SceneProgram::build(source)?);

        if let Ok(mut cache) = self.programs.write() {
            // A racing builder may have inserted first; keep the existing
            // Arc so concurrent callers share one program.
            return Ok(Arc::clone(
                cache.entry(hash).or_insert_with(|| Arc::clone(&program)),
            ));
        }

        Ok(program)
    }

    /// Number of cached programs.
    pub fn len(&self) -> usize {
        self.programs.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPHERE_DOC: &str = r#"{"distance": {"sphere": {"radius": 1.0}}}"#;

    #[test]
    fn test_build_minimal_document() {
        let program = SceneProgram::build(SPHERE_DOC).unwrap();
        assert!(program.color.is_none());
        assert!(program.materials.is_empty());
        assert!(program.distance.eval(Vec3::ZERO) < 0.0);
    }

    #[test]
    fn test_build_resolves_library_refs() {
        let doc = r#"{
            "library": {
                "hole": {"sphere": {"radius": 0.4}},
                "shell": {"subtract": [{"sphere": {"radius": 1.0}}, {"ref": "hole"}]}
            },
            "distance": {"ref": "shell"}
        }"#;
        let program = SceneProgram::build(doc).unwrap();
        // Center carved out, shell solid
        assert!(program.distance.eval(Vec3::ZERO) > 0.0);
        assert!(program.distance.eval(Vec3::new(0.7, 0.0, 0.0)) < 0.0);
    }

    #[test]
    fn test_unresolved_ref_is_an_error() {
        let doc = r#"{"distance": {"ref": "missing"}}"#;
        assert!(matches!(
            SceneProgram::build(doc),
            Err(SceneBuildError::UnresolvedRef(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_circular_ref_is_an_error() {
        let doc = r#"{
            "library": {
                "a": {"union": [{"ref": "b"}]},
                "b": {"union": [{"ref": "a"}]}
            },
            "distance": {"ref": "a"}
        }"#;
        assert!(matches!(
            SceneProgram::build(doc),
            Err(SceneBuildError::CircularRef(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(matches!(
            SceneProgram::build("{not json"),
            Err(SceneBuildError::Parse(_))
        ));
        // Unknown primitive name
        assert!(matches!(
            SceneProgram::build(r#"{"distance": {"blob": {"radius": 1.0}}}"#),
            Err(SceneBuildError::Parse(_))
        ));
    }

    #[test]
    fn test_non_finite_parameter_is_an_error() {
        let doc = r#"{"distance": {"sphere": {"radius": -2.0}}}"#;
        assert!(matches!(
            SceneProgram::build(doc),
            Err(SceneBuildError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_materials_and_defaults() {
        let doc = r#"{
            "distance": {"material": {"id": 3, "child": {"sphere": {"radius": 1.0}}}},
            "materials": [{"id": 3, "base_color": [0.9, 0.1, 0.2]}]
        }"#;
        let program = SceneProgram::build(doc).unwrap();
        assert_eq!(program.material_color(3), Vec3::new(0.9, 0.1, 0.2));
        assert_eq!(program.material_color(99), DEFAULT_BASE_COLOR);
    }

    #[test]
    fn test_rotate_axis_normalized_at_build() {
        let unit = r#"{"distance": {"rotate": {"axis": [0.0, 1.0, 0.0], "angle": 1.5707964,
            "child": {"translate": {"offset": [1.0, 0.0, 0.0],
                      "child": {"sphere": {"radius": 0.5}}}}}}}"#;
        let scaled = unit.replace("[0.0, 1.0, 0.0]", "[0.0, 2.0, 0.0]");
        let a = SceneProgram::build(unit).unwrap();
        let b = SceneProgram::build(&scaled).unwrap();

        // The sphere center rotates to (0, 0, -1); a scaled axis must not
        // change the rotation
        let p = Vec3::new(0.0, 0.0, -1.0);
        assert!(a.distance.eval(p) < -0.49);
        assert!((a.distance.eval(p) - b.distance.eval(p)).abs() < 1e-6);
    }

    #[test]
    fn test_plane_normal_normalized_at_build() {
        let doc = r#"{"distance": {"plane": {"normal": [0.0, 3.0, 0.0], "offset": 0.0}}}"#;
        let program = SceneProgram::build(doc).unwrap();
        // Metric SDF regardless of the document's normal length
        assert!((program.distance.eval(Vec3::new(0.0, 2.0, 0.0)) - 2.0).abs() < 1e-6);
        assert!((program.distance.eval(Vec3::new(0.0, -1.0, 0.0)) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_rotate_axis_rejected_before_normalization() {
        let doc = r#"{"distance": {"rotate": {"axis": [0.0, 0.0, 0.0], "angle": 1.0,
            "child": {"sphere": {"radius": 1.0}}}}}"#;
        assert!(matches!(
            SceneProgram::build(doc),
            Err(SceneBuildError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_cache_hit_returns_same_program() {
        let cache = ProgramCache::new();
        let a = cache.get_or_build(SPHERE_DOC).unwrap();
        let b = cache.get_or_build(SPHERE_DOC).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_rebuilds_on_source_change() {
        let cache = ProgramCache::new();
        let a = cache.get_or_build(SPHERE_DOC).unwrap();
        let b = cache
            .get_or_build(r#"{"distance": {"sphere": {"radius": 2.0}}}"#)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.source_hash, b.source_hash);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_build_failure_leaves_no_trace() {
        let cache = ProgramCache::new();
        assert!(cache.get_or_build("{bad").is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_color_section_parsed() {
        let doc = r#"{
            "distance": {"sphere": {"radius": 1.0}},
            "color": {"rim": 0.25, "posterize_levels": 4}
        }"#;
        let program = SceneProgram::build(doc).unwrap();
        let spec = program.color.unwrap();
        assert_eq!(spec.rim, 0.25);
        assert_eq!(spec.posterize_levels, 4);
        // Unspecified fields take documented defaults
        assert!(spec.soft_shadow);
    }
}
