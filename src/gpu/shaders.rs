//! WGSL generation: scene transpiler plus the extraction pass shaders.
//!
//! The distance expression is transpiled to WGSL from the *same*
//! [`SdfExpr`] tree the CPU interprets, and the marching tables are
//! formatted into the shader source from the same Rust constants the
//! CPU engines index. Neither sampler nor tables can drift between the
//! two paths.
//!
//! # Deep Fried Optimizations
//! - **Division Exorcism**: smooth blends emit `* inv_k` with the
//!   reciprocal folded at transpile time.
//! - **Inline Smooth Ops**: no helper-function call overhead in the
//!   generated distance function.
//! - **Table Embedding**: case counts and triangle tables live in
//!   `var<private>` arrays, no extra bind group slots.
//!
//! Author: Moroya Sakamoto

use std::fmt::Write;

use glam::{Quat, Vec3};

use crate::engine::Algorithm;
use crate::scene::{ColorSpec, SceneProgram, SdfExpr, FOLD_EPSILON};
use crate::tables::{case_vertex_counts, CORNER_OFFSETS, EDGE_CONNECTIONS, TRI_TABLE};

/// Uniform block shared by the field, classify, and mesh passes.
/// Layout matches `ChunkUniforms` in the dispatch module.
const PARAMS_STRUCT: &str = r#"struct Params {
    nx: u32,
    ny: u32,
    nz: u32,
    time: f32,
    bounds_min: vec4<f32>,
    bounds_max: vec4<f32>,
    window_lo: vec4<u32>,
    window_hi: vec4<u32>,
    voxel_half: vec4<f32>,
}
"#;

const GRID_HELPERS: &str = r#"fn cell_size() -> vec3<f32> {
    return (params.bounds_max.xyz - params.bounds_min.xyz)
        / vec3<f32>(f32(params.nx - 1u), f32(params.ny - 1u), f32(params.nz - 1u));
}

fn grid_position(ix: u32, iy: u32, iz: u32) -> vec3<f32> {
    return params.bounds_min.xyz + cell_size() * vec3<f32>(f32(ix), f32(iy), f32(iz));
}

fn point_index(ix: u32, iy: u32, iz: u32) -> u32 {
    return ix + iy * params.nx + iz * params.nx * params.ny;
}
"#;

const FIELD_HELPERS: &str = r#"fn field_at(ix: u32, iy: u32, iz: u32) -> f32 {
    return field[point_index(ix, iy, iz)];
}

fn field_grad(ix: u32, iy: u32, iz: u32) -> vec3<f32> {
    let cell = cell_size();
    let xp = min(ix + 1u, params.nx - 1u);
    let xm = select(ix - 1u, 0u, ix == 0u);
    let yp = min(iy + 1u, params.ny - 1u);
    let ym = select(iy - 1u, 0u, iy == 0u);
    let zp = min(iz + 1u, params.nz - 1u);
    let zm = select(iz - 1u, 0u, iz == 0u);
    return vec3<f32>(
        (field_at(xp, iy, iz) - field_at(xm, iy, iz)) / (f32(xp - xm) * cell.x),
        (field_at(ix, yp, iz) - field_at(ix, ym, iz)) / (f32(yp - ym) * cell.y),
        (field_at(ix, iy, zp) - field_at(ix, iy, zm)) / (f32(zp - zm) * cell.z),
    );
}
"#;

const HELPER_QUAT_ROTATE: &str = r#"fn quat_rotate(v: vec3<f32>, q: vec4<f32>) -> vec3<f32> {
    let t = 2.0 * cross(q.xyz, v);
    return v + q.w * t + cross(q.xyz, t);
}
"#;

/// Transpiler state: unique variable names plus the helper registry.
struct SceneTranspiler {
    var_counter: usize,
    helper_functions: Vec<&'static str>,
}

impl SceneTranspiler {
    fn new() -> Self {
        SceneTranspiler {
            var_counter: 0,
            helper_functions: Vec::new(),
        }
    }

    fn next_var(&mut self, prefix: &str) -> String {
        let var = format!("{}{}", prefix, self.var_counter);
        self.var_counter += 1;
        var
    }

    fn ensure_helper(&mut self, name: &'static str) {
        if !self.helper_functions.contains(&name) {
            self.helper_functions.push(name);
        }
    }

    fn helpers(&self) -> String {
        let mut out = String::new();
        for helper in &self.helper_functions {
            if *helper == "quat_rotate" {
                out.push_str(HELPER_QUAT_ROTATE);
                out.push('\n');
            }
        }
        out
    }

    /// Emit the distance of `expr` at `point_var`; returns the result var.
    fn dist(&mut self, expr: &SdfExpr, point_var: &str, code: &mut String) -> String {
        match expr {
            SdfExpr::Sphere { radius } => {
                let var = self.next_var("d");
                let _ = writeln!(code, "    let {} = length({}) - {:.6};", var, point_var, radius);
                var
            }

            SdfExpr::Box3 { half_extents } => {
                let q = self.next_var("d");
                let var = self.next_var("d");
                let _ = writeln!(
                    code,
                    "    let {} = abs({}) - vec3<f32>({:.6}, {:.6}, {:.6});",
                    q, point_var, half_extents[0], half_extents[1], half_extents[2]
                );
                let _ = writeln!(
                    code,
                    "    let {} = length(max({}, vec3<f32>(0.0))) + min(max({}.x, max({}.y, {}.z)), 0.0);",
                    var, q, q, q, q
                );
                var
            }

            SdfExpr::RoundBox { half_extents, radius } => {
                let inner = self.dist(
                    &SdfExpr::Box3 { half_extents: *half_extents },
                    point_var,
                    code,
                );
                let var = self.next_var("d");
                let _ = writeln!(code, "    let {} = {} - {:.6};", var, inner, radius);
                var
            }

            SdfExpr::Cylinder { radius, half_height } => {
                let d = self.next_var("d");
                let var = self.next_var("d");
                let _ = writeln!(
                    code,
                    "    let {} = vec2<f32>(length({}.xz) - {:.6}, abs({}.y) - {:.6});",
                    d, point_var, radius, point_var, half_height
                );
                let _ = writeln!(
                    code,
                    "    let {} = min(max({}.x, {}.y), 0.0) + length(max({}, vec2<f32>(0.0)));",
                    var, d, d, d
                );
                var
            }

            SdfExpr::Torus { major_radius, minor_radius } => {
                let q = self.next_var("d");
                let var = self.next_var("d");
                let _ = writeln!(
                    code,
                    "    let {} = vec2<f32>(length({}.xz) - {:.6}, {}.y);",
                    q, point_var, major_radius, point_var
                );
                let _ = writeln!(code, "    let {} = length({}) - {:.6};", var, q, minor_radius);
                var
            }

            SdfExpr::Plane { normal, offset } => {
                let var = self.next_var("d");
                let _ = writeln!(
                    code,
                    "    let {} = dot({}, vec3<f32>({:.6}, {:.6}, {:.6})) + {:.6};",
                    var, point_var, normal[0], normal[1], normal[2], offset
                );
                var
            }

            SdfExpr::Capsule { a, b, radius } => {
                let pa = self.next_var("d");
                let ba = self.next_var("d");
                let h = self.next_var("d");
                let var = self.next_var("d");
                let _ = writeln!(
                    code,
                    "    let {} = {} - vec3<f32>({:.6}, {:.6}, {:.6});",
                    pa, point_var, a[0], a[1], a[2]
                );
                let _ = writeln!(
                    code,
                    "    let {} = vec3<f32>({:.6}, {:.6}, {:.6}) - vec3<f32>({:.6}, {:.6}, {:.6});",
                    ba, b[0], b[1], b[2], a[0], a[1], a[2]
                );
                let _ = writeln!(
                    code,
                    "    let {} = clamp(dot({}, {}) / dot({}, {}), 0.0, 1.0);",
                    h, pa, ba, ba, ba
                );
                let _ = writeln!(
                    code,
                    "    let {} = length({} - {} * {}) - {:.6};",
                    var, pa, ba, h, radius
                );
                var
            }

            SdfExpr::Union(items) => {
                self.fold_dist(items, point_var, code, |code, var, acc, cur| {
                    let _ = writeln!(code, "    let {} = min({}, {});", var, acc, cur);
                })
            }

            SdfExpr::Intersect(items) => {
                self.fold_dist(items, point_var, code, |code, var, acc, cur| {
                    let _ = writeln!(code, "    let {} = max({}, {});", var, acc, cur);
                })
            }

            SdfExpr::Subtract(items) => {
                self.fold_dist(items, point_var, code, |code, var, acc, cur| {
                    let _ = writeln!(code, "    let {} = max({}, -{});", var, acc, cur);
                })
            }

            // Division Exorcism: 1/k folded at transpile time, MUL not DIV
            SdfExpr::SmoothUnion { k, items } => {
                if k.abs() < FOLD_EPSILON {
                    return self.dist(&SdfExpr::Union(items.clone()), point_var, code);
                }
                let inv_k = 1.0 / k;
                let k = *k;
                self.fold_dist(items, point_var, code, move |code, var, acc, cur| {
                    let h = format!("{}_h", var);
                    let _ = writeln!(
                        code,
                        "    let {} = max({:.6} - abs({} - {}), 0.0) * {:.6};",
                        h, k, acc, cur, inv_k
                    );
                    let _ = writeln!(
                        code,
                        "    let {} = min({}, {}) - {} * {} * {:.6} * 0.25;",
                        var, acc, cur, h, h, k
                    );
                })
            }

            SdfExpr::SmoothIntersect { k, items } => {
                if k.abs() < FOLD_EPSILON {
                    return self.dist(&SdfExpr::Intersect(items.clone()), point_var, code);
                }
                let inv_k = 1.0 / k;
                let k = *k;
                self.fold_dist(items, point_var, code, move |code, var, acc, cur| {
                    let h = format!("{}_h", var);
                    let _ = writeln!(
                        code,
                        "    let {} = max({:.6} - abs({} - {}), 0.0) * {:.6};",
                        h, k, acc, cur, inv_k
                    );
                    let _ = writeln!(
                        code,
                        "    let {} = max({}, {}) + {} * {} * {:.6} * 0.25;",
                        var, acc, cur, h, h, k
                    );
                })
            }

            SdfExpr::SmoothSubtract { k, items } => {
                if k.abs() < FOLD_EPSILON {
                    return self.dist(&SdfExpr::Subtract(items.clone()), point_var, code);
                }
                let inv_k = 1.0 / k;
                let k = *k;
                self.fold_dist(items, point_var, code, move |code, var, acc, cur| {
                    let h = format!("{}_h", var);
                    let _ = writeln!(
                        code,
                        "    let {} = max({:.6} - abs({} - (-{})), 0.0) * {:.6};",
                        h, k, acc, cur, inv_k
                    );
                    let _ = writeln!(
                        code,
                        "    let {} = max({}, -{}) + {} * {} * {:.6} * 0.25;",
                        var, acc, cur, h, h, k
                    );
                })
            }

            SdfExpr::Translate { offset, child } => {
                let new_p = self.translate_point(point_var, *offset, code);
                self.dist(child, &new_p, code)
            }

            SdfExpr::Rotate { axis, angle, child } => {
                let new_p = self.rotate_point(point_var, *axis, *angle, code);
                self.dist(child, &new_p, code)
            }

            SdfExpr::Scale { factor, child } => {
                let new_p = self.scale_point(point_var, *factor, code);
                let d = self.dist(child, &new_p, code);
                let var = self.next_var("d");
                let _ = writeln!(code, "    let {} = {} * {:.6};", var, d, factor);
                var
            }

            SdfExpr::Round { radius, child } => {
                let d = self.dist(child, point_var, code);
                let var = self.next_var("d");
                let _ = writeln!(code, "    let {} = {} - {:.6};", var, d, radius);
                var
            }

            SdfExpr::Onion { thickness, child } => {
                let d = self.dist(child, point_var, code);
                let var = self.next_var("d");
                let _ = writeln!(code, "    let {} = abs({}) - {:.6};", var, d, thickness);
                var
            }

            SdfExpr::Material { child, .. } => self.dist(child, point_var, code),

            // Resolved away at build time; an orphan is empty space.
            SdfExpr::Ref(_) => {
                let var = self.next_var("d");
                let _ = writeln!(code, "    let {} = 3.4e38;", var);
                var
            }
        }
    }

    fn fold_dist(
        &mut self,
        items: &[SdfExpr],
        point_var: &str,
        code: &mut String,
        mut combine: impl FnMut(&mut String, &str, &str, &str),
    ) -> String {
        let mut acc = match items.first() {
            Some(first) => self.dist(first, point_var, code),
            None => {
                let var = self.next_var("d");
                let _ = writeln!(code, "    let {} = 3.4e38;", var);
                return var;
            }
        };
        for item in &items[1..] {
            let cur = self.dist(item, point_var, code);
            let var = self.next_var("d");
            combine(code, &var, &acc, &cur);
            acc = var;
        }
        acc
    }

    fn translate_point(&mut self, point_var: &str, offset: [f32; 3], code: &mut String) -> String {
        let new_p = self.next_var("p");
        let _ = writeln!(
            code,
            "    let {} = {} - vec3<f32>({:.6}, {:.6}, {:.6});",
            new_p, point_var, offset[0], offset[1], offset[2]
        );
        new_p
    }

    fn rotate_point(&mut self, point_var: &str, axis: [f32; 3], angle: f32, code: &mut String) -> String {
        self.ensure_helper("quat_rotate");
        let inv = Quat::from_axis_angle(Vec3::from(axis).normalize_or_zero(), angle).inverse();
        let new_p = self.next_var("p");
        let _ = writeln!(
            code,
            "    let {} = quat_rotate({}, vec4<f32>({:.6}, {:.6}, {:.6}, {:.6}));",
            new_p, point_var, inv.x, inv.y, inv.z, inv.w
        );
        new_p
    }

    fn scale_point(&mut self, point_var: &str, factor: f32, code: &mut String) -> String {
        let new_p = self.next_var("p");
        let _ = writeln!(code, "    let {} = {} * {:.6};", new_p, point_var, 1.0 / factor);
        new_p
    }

    /// Emit distance *and* material id as a `vec2<f32>(d, id)` value.
    ///
    /// Mirrors `SdfExpr::eval_material`: boolean nodes forward the id of
    /// the winning branch, `material` overrides only untagged subtrees.
    fn mat(&mut self, expr: &SdfExpr, point_var: &str, code: &mut String) -> String {
        match expr {
            SdfExpr::Union(items) => {
                self.fold_mat(items, point_var, code, |code, var, acc, cur| {
                    let _ = writeln!(
                        code,
                        "    let {} = select({}, {}, {}.x < {}.x);",
                        var, acc, cur, cur, acc
                    );
                })
            }

            SdfExpr::Intersect(items) => {
                self.fold_mat(items, point_var, code, |code, var, acc, cur| {
                    let _ = writeln!(
                        code,
                        "    let {} = select({}, {}, {}.x > {}.x);",
                        var, acc, cur, cur, acc
                    );
                })
            }

            // Carved-away material never shows; the base branch id rides
            // on the blended distance.
            SdfExpr::Subtract(items) | SdfExpr::SmoothSubtract { items, .. } => {
                let d = self.dist(expr, point_var, code);
                let id = match items.first() {
                    Some(first) => {
                        let m = self.mat(first, point_var, code);
                        format!("{}.y", m)
                    }
                    None => "0.0".to_string(),
                };
                let var = self.next_var("m");
                let _ = writeln!(code, "    let {} = vec2<f32>({}, {});", var, d, id);
                var
            }

            SdfExpr::SmoothUnion { items, .. } => {
                let d = self.dist(expr, point_var, code);
                let winner = self.fold_mat(items, point_var, code, |code, var, acc, cur| {
                    let _ = writeln!(
                        code,
                        "    let {} = select({}, {}, {}.x < {}.x);",
                        var, acc, cur, cur, acc
                    );
                });
                let var = self.next_var("m");
                let _ = writeln!(code, "    let {} = vec2<f32>({}, {}.y);", var, d, winner);
                var
            }

            SdfExpr::SmoothIntersect { items, .. } => {
                let d = self.dist(expr, point_var, code);
                let winner = self.fold_mat(items, point_var, code, |code, var, acc, cur| {
                    let _ = writeln!(
                        code,
                        "    let {} = select({}, {}, {}.x > {}.x);",
                        var, acc, cur, cur, acc
                    );
                });
                let var = self.next_var("m");
                let _ = writeln!(code, "    let {} = vec2<f32>({}, {}.y);", var, d, winner);
                var
            }

            SdfExpr::Translate { offset, child } => {
                let new_p = self.translate_point(point_var, *offset, code);
                self.mat(child, &new_p, code)
            }

            SdfExpr::Rotate { axis, angle, child } => {
                let new_p = self.rotate_point(point_var, *axis, *angle, code);
                self.mat(child, &new_p, code)
            }

            SdfExpr::Scale { factor, child } => {
                let new_p = self.scale_point(point_var, *factor, code);
                let m = self.mat(child, &new_p, code);
                let var = self.next_var("m");
                let _ = writeln!(
                    code,
                    "    let {} = vec2<f32>({}.x * {:.6}, {}.y);",
                    var, m, factor, m
                );
                var
            }

            SdfExpr::Round { radius, child } => {
                let m = self.mat(child, point_var, code);
                let var = self.next_var("m");
                let _ = writeln!(
                    code,
                    "    let {} = vec2<f32>({}.x - {:.6}, {}.y);",
                    var, m, radius, m
                );
                var
            }

            SdfExpr::Onion { thickness, child } => {
                let m = self.mat(child, point_var, code);
                let var = self.next_var("m");
                let _ = writeln!(
                    code,
                    "    let {} = vec2<f32>(abs({}.x) - {:.6}, {}.y);",
                    var, m, thickness, m
                );
                var
            }

            SdfExpr::Material { id, child } => {
                let m = self.mat(child, point_var, code);
                let var = self.next_var("m");
                let _ = writeln!(
                    code,
                    "    let {} = vec2<f32>({}.x, select(f32({}u), {}.y, {}.y != 0.0));",
                    var, m, id, m, m
                );
                var
            }

            // Primitives and anything untagged: id 0
            _ => {
                let d = self.dist(expr, point_var, code);
                let var = self.next_var("m");
                let _ = writeln!(code, "    let {} = vec2<f32>({}, 0.0);", var, d);
                var
            }
        }
    }

    fn fold_mat(
        &mut self,
        items: &[SdfExpr],
        point_var: &str,
        code: &mut String,
        mut combine: impl FnMut(&mut String, &str, &str, &str),
    ) -> String {
        let mut acc = match items.first() {
            Some(first) => self.mat(first, point_var, code),
            None => {
                let var = self.next_var("m");
                let _ = writeln!(code, "    let {} = vec2<f32>(3.4e38, 0.0);", var);
                return var;
            }
        };
        for item in &items[1..] {
            let cur = self.mat(item, point_var, code);
            let var = self.next_var("m");
            combine(code, &var, &acc, &cur);
            acc = var;
        }
        acc
    }
}

/// Generate `fn scene_dist(p) -> f32` plus any helpers it needs.
fn scene_dist_function(expr: &SdfExpr) -> String {
    let mut transpiler = SceneTranspiler::new();
    let mut body = String::new();
    let result = transpiler.dist(expr, "p", &mut body);

    let mut out = transpiler.helpers();
    out.push_str("fn scene_dist(p: vec3<f32>) -> f32 {\n");
    out.push_str(&body);
    let _ = writeln!(out, "    return {};", result);
    out.push_str("}\n");
    out
}

/// Generate `fn scene_dist_mat(p) -> vec2<f32>` (distance, material id).
fn scene_mat_function(expr: &SdfExpr) -> String {
    let mut transpiler = SceneTranspiler::new();
    let mut body = String::new();
    let result = transpiler.mat(expr, "p", &mut body);

    let mut out = transpiler.helpers();
    out.push_str("fn scene_dist_mat(p: vec3<f32>) -> vec2<f32> {\n");
    out.push_str(&body);
    let _ = writeln!(out, "    return {};", result);
    out.push_str("}\n");
    out
}

// ── Table embedding ─────────────────────────────────────────────────

fn embed_case_counts() -> String {
    let counts = case_vertex_counts();
    let mut out = String::from("var<private> CASE_COUNTS: array<u32, 256> = array<u32, 256>(");
    for (i, c) in counts.iter().enumerate() {
        if i % 16 == 0 {
            out.push_str("\n    ");
        }
        let _ = write!(out, "{}u, ", c);
    }
    out.push_str("\n);\n");
    out
}

fn embed_tri_table() -> String {
    let mut out = String::from("var<private> TRI_TABLE: array<i32, 4096> = array<i32, 4096>(");
    for row in TRI_TABLE.iter() {
        out.push_str("\n    ");
        for v in row.iter() {
            let _ = write!(out, "{}, ", v);
        }
    }
    out.push_str("\n);\n");
    out
}

fn embed_edge_endpoints() -> String {
    let mut a = String::from("var<private> EDGE_A: array<u32, 12> = array<u32, 12>(");
    let mut b = String::from("var<private> EDGE_B: array<u32, 12> = array<u32, 12>(");
    for pair in EDGE_CONNECTIONS.iter() {
        let _ = write!(a, "{}u, ", pair[0]);
        let _ = write!(b, "{}u, ", pair[1]);
    }
    a.push_str(");\n");
    b.push_str(");\n");
    a + &b
}

fn embed_corners() -> String {
    let mut out = String::from("var<private> CORNERS: array<vec3<u32>, 8> = array<vec3<u32>, 8>(\n");
    for c in CORNER_OFFSETS.iter() {
        let _ = writeln!(out, "    vec3<u32>({}u, {}u, {}u),", c[0], c[1], c[2]);
    }
    out.push_str(");\n");
    out
}

// ── Pass shaders ────────────────────────────────────────────────────

/// Pass 1: sample the scene distance at every grid point.
pub(crate) fn field_shader(program: &SceneProgram) -> String {
    format!(
        r#"// Generated field sampler

{params}
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read_write> field: array<f32>;

{grid}
{dist}
@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {{
    let idx = global_id.x + global_id.y * 2097152u;
    if (idx >= params.nx * params.ny * params.nz) {{
        return;
    }}
    let ix = idx % params.nx;
    let iy = (idx / params.nx) % params.ny;
    let iz = idx / (params.nx * params.ny);
    field[idx] = scene_dist(grid_position(ix, iy, iz));
}}
"#,
        params = PARAMS_STRUCT,
        grid = GRID_HELPERS,
        dist = scene_dist_function(&program.distance),
    )
}

/// Pass 2: classify cells and count output vertices per cell.
///
/// Cells outside the owned window count zero, which is what makes
/// chunked output identical to a single-chunk run.
pub(crate) fn classify_shader(algorithm: Algorithm) -> String {
    let (tables, count_expr) = match algorithm {
        Algorithm::Cubes => (String::new(), "24u".to_string()),
        _ => (embed_case_counts(), "CASE_COUNTS[case_index]".to_string()),
    };

    format!(
        r#"// Generated cell classifier

{params}
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> field: array<f32>;
@group(0) @binding(2) var<storage, read_write> counts: array<u32>;
@group(0) @binding(3) var<storage, read_write> cases: array<u32>;
@group(0) @binding(4) var<storage, read_write> total: atomic<u32>;

{corners}
{tables}
fn field_at(ix: u32, iy: u32, iz: u32) -> f32 {{
    return field[ix + iy * params.nx + iz * params.nx * params.ny];
}}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {{
    let idx = global_id.x + global_id.y * 2097152u;
    let cells = vec3<u32>(params.nx - 1u, params.ny - 1u, params.nz - 1u);
    if (idx >= cells.x * cells.y * cells.z) {{
        return;
    }}
    let cx = idx % cells.x;
    let cy = (idx / cells.x) % cells.y;
    let cz = idx / (cells.x * cells.y);

    var case_index = 0u;
    for (var i = 0u; i < 8u; i = i + 1u) {{
        let c = CORNERS[i];
        if (field_at(cx + c.x, cy + c.y, cz + c.z) <= 0.0) {{
            case_index = case_index | (1u << i);
        }}
    }}

    let owned = cx >= params.window_lo.x && cx < params.window_hi.x
        && cy >= params.window_lo.y && cy < params.window_hi.y
        && cz >= params.window_lo.z && cz < params.window_hi.z;
    let is_active = case_index != 0u && case_index != 255u;

    var count = 0u;
    if (owned && is_active) {{
        count = {count_expr};
    }}
    counts[idx] = count;
    cases[idx] = case_index;
    if (count > 0u) {{
        atomicAdd(&total, count);
    }}
}}
"#,
        params = PARAMS_STRUCT,
        corners = embed_corners(),
        tables = tables,
        count_expr = count_expr,
    )
}

/// Pass 3 for marching cubes: emit triangle-soup vertices at the
/// prefix-sum offsets. Normals are endpoint grid gradients lerped by
/// the crossing parameter, the same rule the CPU engine applies.
pub(crate) fn marching_cubes_shader() -> String {
    format!(
        r#"// Generated marching cubes mesher

{params}
struct VertexOut {{
    position: vec4<f32>,
    normal: vec4<f32>,
}}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> field: array<f32>;
@group(0) @binding(2) var<storage, read> counts: array<u32>;
@group(0) @binding(3) var<storage, read> cases: array<u32>;
@group(0) @binding(4) var<storage, read> offsets: array<u32>;
@group(0) @binding(5) var<storage, read_write> vertices: array<VertexOut>;

{grid}
{field_helpers}
{corners}
{edges}
{tri_table}
@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {{
    let idx = global_id.x + global_id.y * 2097152u;
    let cells = vec3<u32>(params.nx - 1u, params.ny - 1u, params.nz - 1u);
    if (idx >= cells.x * cells.y * cells.z) {{
        return;
    }}
    if (counts[idx] == 0u) {{
        return;
    }}
    let cx = idx % cells.x;
    let cy = (idx / cells.x) % cells.y;
    let cz = idx / (cells.x * cells.y);
    let case_index = cases[idx];

    var corner_v: array<f32, 8>;
    var corner_p: array<vec3<f32>, 8>;
    for (var i = 0u; i < 8u; i = i + 1u) {{
        let c = CORNERS[i];
        corner_v[i] = field_at(cx + c.x, cy + c.y, cz + c.z);
        corner_p[i] = grid_position(cx + c.x, cy + c.y, cz + c.z);
    }}

    var out = offsets[idx];
    for (var i = 0u; i < 15u; i = i + 3u) {{
        if (TRI_TABLE[case_index * 16u + i] < 0) {{
            break;
        }}
        for (var j = 0u; j < 3u; j = j + 1u) {{
            let e = u32(TRI_TABLE[case_index * 16u + i + j]);
            let a = EDGE_A[e];
            let b = EDGE_B[e];
            let va = corner_v[a];
            let vb = corner_v[b];
            let t = clamp(-va / (vb - va), 0.0, 1.0);
            let pos = mix(corner_p[a], corner_p[b], t);

            let ca = CORNERS[a];
            let cb = CORNERS[b];
            let ga = field_grad(cx + ca.x, cy + ca.y, cz + ca.z);
            let gb = field_grad(cx + cb.x, cy + cb.y, cz + cb.z);
            var n = mix(ga, gb, t);
            let len_sq = dot(n, n);
            if (len_sq < 1e-20) {{
                n = vec3<f32>(0.0, 1.0, 0.0);
            }} else {{
                n = n / sqrt(len_sq);
            }}

            vertices[out] = VertexOut(vec4<f32>(pos, 1.0), vec4<f32>(n, 0.0));
            out = out + 1u;
        }}
    }}
}}
"#,
        params = PARAMS_STRUCT,
        grid = GRID_HELPERS,
        field_helpers = FIELD_HELPERS,
        corners = embed_corners(),
        edges = embed_edge_endpoints(),
        tri_table = embed_tri_table(),
    )
}

/// Pass 3 for the cubes debug engine: 24 face-normal vertices per
/// active owned cell. Indices are derived on the CPU from the counts.
pub(crate) fn cubes_shader() -> String {
    format!(
        r#"// Generated cubes mesher

{params}
struct VertexOut {{
    position: vec4<f32>,
    normal: vec4<f32>,
}}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> field: array<f32>;
@group(0) @binding(2) var<storage, read> counts: array<u32>;
@group(0) @binding(3) var<storage, read> cases: array<u32>;
@group(0) @binding(4) var<storage, read> offsets: array<u32>;
@group(0) @binding(5) var<storage, read_write> vertices: array<VertexOut>;

{grid}
var<private> FACE_N: array<vec3<f32>, 6> = array<vec3<f32>, 6>(
    vec3<f32>(1.0, 0.0, 0.0),
    vec3<f32>(-1.0, 0.0, 0.0),
    vec3<f32>(0.0, 1.0, 0.0),
    vec3<f32>(0.0, -1.0, 0.0),
    vec3<f32>(0.0, 0.0, 1.0),
    vec3<f32>(0.0, 0.0, -1.0),
);
var<private> FACE_C: array<vec3<f32>, 24> = array<vec3<f32>, 24>(
    vec3<f32>(1.0, -1.0, -1.0), vec3<f32>(1.0, 1.0, -1.0), vec3<f32>(1.0, 1.0, 1.0), vec3<f32>(1.0, -1.0, 1.0),
    vec3<f32>(-1.0, -1.0, 1.0), vec3<f32>(-1.0, 1.0, 1.0), vec3<f32>(-1.0, 1.0, -1.0), vec3<f32>(-1.0, -1.0, -1.0),
    vec3<f32>(-1.0, 1.0, -1.0), vec3<f32>(-1.0, 1.0, 1.0), vec3<f32>(1.0, 1.0, 1.0), vec3<f32>(1.0, 1.0, -1.0),
    vec3<f32>(-1.0, -1.0, 1.0), vec3<f32>(-1.0, -1.0, -1.0), vec3<f32>(1.0, -1.0, -1.0), vec3<f32>(1.0, -1.0, 1.0),
    vec3<f32>(-1.0, -1.0, 1.0), vec3<f32>(1.0, -1.0, 1.0), vec3<f32>(1.0, 1.0, 1.0), vec3<f32>(-1.0, 1.0, 1.0),
    vec3<f32>(1.0, -1.0, -1.0), vec3<f32>(-1.0, -1.0, -1.0), vec3<f32>(-1.0, 1.0, -1.0), vec3<f32>(1.0, 1.0, -1.0),
);

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {{
    let idx = global_id.x + global_id.y * 2097152u;
    let cells = vec3<u32>(params.nx - 1u, params.ny - 1u, params.nz - 1u);
    if (idx >= cells.x * cells.y * cells.z) {{
        return;
    }}
    if (counts[idx] == 0u) {{
        return;
    }}
    let cx = idx % cells.x;
    let cy = (idx / cells.x) % cells.y;
    let cz = idx / (cells.x * cells.y);

    let center = grid_position(cx, cy, cz) + cell_size() * 0.5;
    let half = params.voxel_half.xyz;

    var out = offsets[idx];
    for (var f = 0u; f < 6u; f = f + 1u) {{
        let n = FACE_N[f];
        for (var v = 0u; v < 4u; v = v + 1u) {{
            let corner = center + FACE_C[f * 4u + v] * half;
            vertices[out] = VertexOut(vec4<f32>(corner, 1.0), vec4<f32>(n, 0.0));
            out = out + 1u;
        }}
    }}
}}
"#,
        params = PARAMS_STRUCT,
        grid = GRID_HELPERS,
    )
}

/// Generate the vertex color pass for a scene with a `color` section.
///
/// Every lighting constant is folded into the source and disabled terms
/// are omitted entirely, mirroring the CPU shader term for term.
pub(crate) fn color_shader(program: &SceneProgram, spec: &ColorSpec) -> String {
    let mut functions = scene_dist_function(&program.distance);
    functions.push('\n');
    functions.push_str(&scene_mat_function(&program.distance));

    // Deterministic if-chain regardless of map iteration order
    let mut materials: Vec<(u32, Vec3)> = program.materials.iter().map(|(k, v)| (*k, *v)).collect();
    materials.sort_by_key(|(id, _)| *id);

    let mut mat_fn = String::from("fn material_color(id: u32) -> vec3<f32> {\n");
    for (id, c) in &materials {
        let _ = writeln!(
            mat_fn,
            "    if (id == {}u) {{ return vec3<f32>({:.6}, {:.6}, {:.6}); }}",
            id, c.x, c.y, c.z
        );
    }
    mat_fn.push_str("    return vec3<f32>(0.8, 0.8, 0.8);\n}\n");

    let mut helpers = String::new();
    if spec.soft_shadow {
        helpers.push_str(
            r#"fn soft_shadow(origin: vec3<f32>, l: vec3<f32>) -> f32 {
    var res = 1.0;
    var t = 0.02;
    for (var i = 0; i < 32; i = i + 1) {
        let h = scene_dist(origin + l * t);
        res = min(res, 16.0 * h / t);
        if (res < 0.001 || t > 10.0) {
            break;
        }
        t = t + clamp(h, 0.01, 0.5);
    }
    return clamp(res, 0.0, 1.0);
}
"#,
        );
    }
    if spec.ambient_occlusion {
        helpers.push_str(
            r#"fn calc_ao(p: vec3<f32>, n: vec3<f32>) -> f32 {
    var occ = 0.0;
    var sca = 1.0;
    for (var i = 0; i < 5; i = i + 1) {
        let h = 0.01 + 0.12 * f32(i) / 4.0;
        let d = scene_dist(p + n * h);
        occ = occ + (h - d) * sca;
        sca = sca * 0.95;
    }
    return clamp(1.0 - 3.0 * occ, 0.0, 1.0);
}
"#,
        );
    }
    if spec.brush_scale > 0.0 {
        helpers.push_str(
            r#"fn hash2(p: vec2<f32>) -> f32 {
    let h = dot(p, vec2<f32>(127.1, 311.7));
    return fract(sin(h) * 43758.5453);
}

fn noise2(p: vec2<f32>) -> f32 {
    let i = floor(p);
    let f = p - i;
    let u = f * f * (vec2<f32>(3.0) - 2.0 * f);
    let a = hash2(i);
    let b = hash2(i + vec2<f32>(1.0, 0.0));
    let c = hash2(i + vec2<f32>(0.0, 1.0));
    let d = hash2(i + vec2<f32>(1.0, 1.0));
    return a + (b - a) * u.x + (c - a) * u.y + (a - b - c + d) * u.x * u.y;
}

fn fbm2(p_in: vec2<f32>) -> f32 {
    var p = p_in;
    var value = 0.0;
    var amplitude = 0.5;
    for (var i = 0; i < 3; i = i + 1) {
        value = value + amplitude * noise2(p);
        p = p * 2.0;
        amplitude = amplitude * 0.5;
    }
    return value;
}

fn triplanar_uv(p: vec3<f32>, n: vec3<f32>) -> vec2<f32> {
    let an = abs(n);
    if (an.x >= an.y && an.x >= an.z) {
        return vec2<f32>(p.y, p.z);
    } else if (an.y >= an.z) {
        return vec2<f32>(p.x, p.z);
    }
    return vec2<f32>(p.x, p.y);
}
"#,
        );
    }

    let mut body = String::new();
    let _ = writeln!(body, "    let m = scene_dist_mat(p);");
    let _ = writeln!(body, "    let base = material_color(u32(m.y));");
    let _ = writeln!(
        body,
        "    let l = normalize(vec3<f32>({:.6}, {:.6}, {:.6}));",
        spec.light_dir[0], spec.light_dir[1], spec.light_dir[2]
    );
    let _ = writeln!(
        body,
        "    let v = normalize(vec3<f32>({:.6}, {:.6}, {:.6}) - p);",
        spec.camera_pos[0], spec.camera_pos[1], spec.camera_pos[2]
    );
    let _ = writeln!(body, "    let diff = max(dot(n, l), 0.0);");
    if spec.soft_shadow {
        let _ = writeln!(body, "    let shadow = soft_shadow(p + n * 0.02, l);");
    } else {
        let _ = writeln!(body, "    let shadow = 1.0;");
    }
    if spec.ambient_occlusion {
        let _ = writeln!(body, "    let ao = calc_ao(p, n);");
    } else {
        let _ = writeln!(body, "    let ao = 1.0;");
    }
    let _ = writeln!(
        body,
        "    var col = base * ({:.6} * ao + diff * shadow);",
        spec.ambient
    );
    if spec.specular > 0.0 {
        let _ = writeln!(body, "    let r = normalize(2.0 * dot(n, l) * n - l);");
        let _ = writeln!(
            body,
            "    col = col + vec3<f32>({:.6} * pow(max(dot(r, v), 0.0), {:.6}) * shadow);",
            spec.specular, spec.shininess
        );
    }
    if spec.rim > 0.0 {
        let _ = writeln!(
            body,
            "    col = col + vec3<f32>({:.6} * pow(1.0 - max(dot(n, v), 0.0), 3.0));",
            spec.rim
        );
    }
    if spec.posterize_levels >= 2 {
        let _ = writeln!(
            body,
            "    col = floor(col * {:.6}) / {:.6};",
            spec.posterize_levels as f32, spec.posterize_levels as f32
        );
    }
    if spec.brush_scale > 0.0 {
        let _ = writeln!(
            body,
            "    let uv = triplanar_uv(p, n) * {:.6} + vec2<f32>(cparams.time * 0.05);",
            spec.brush_scale
        );
        let _ = writeln!(body, "    col = col * (0.85 + 0.3 * fbm2(uv));");
    }
    if spec.edge_darken > 0.0 {
        let _ = writeln!(
            body,
            "    col = col * (1.0 - {:.6} * (1.0 - ao));",
            spec.edge_darken
        );
    }

    format!(
        r#"// Generated vertex color pass

struct ColorParams {{
    count: u32,
    time: f32,
    _pad0: f32,
    _pad1: f32,
}}

@group(0) @binding(0) var<uniform> cparams: ColorParams;
@group(0) @binding(1) var<storage, read> positions: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read> normals: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read_write> colors: array<vec4<f32>>;

{functions}
{mat_fn}
{helpers}
@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {{
    let idx = global_id.x + global_id.y * 2097152u;
    if (idx >= cparams.count) {{
        return;
    }}
    let p = positions[idx].xyz;
    let n = normals[idx].xyz;

{body}
    colors[idx] = vec4<f32>(clamp(col, vec3<f32>(0.0), vec3<f32>(1.0)), 1.0);
}}
"#,
        functions = functions,
        mat_fn = mat_fn,
        helpers = helpers,
        body = body,
    )
}
