//! SDF expression trees: the distance function both engines share.
//!
//! The expression is the single source of truth for scene geometry. The
//! CPU engine interprets it directly with [`SdfExpr::eval`]; the GPU
//! path transpiles the *same* tree to WGSL, so the two samplers cannot
//! drift apart.
//!
//! Author: Moroya Sakamoto

use glam::{Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Epsilon for constant folding (skip smooth blends that are no-ops)
pub(crate) const FOLD_EPSILON: f32 = 1e-6;

/// One node of a scene distance expression.
///
/// This enum is also the JSON schema of the `distance` and `library`
/// sections of a scene document (externally tagged, snake_case).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SdfExpr {
    /// Sphere centered at the origin.
    Sphere {
        /// Sphere radius.
        radius: f32,
    },
    /// Axis-aligned box centered at the origin.
    #[serde(rename = "box")]
    Box3 {
        /// Half extent along each axis.
        half_extents: [f32; 3],
    },
    /// Box with rounded edges.
    RoundBox {
        /// Half extent along each axis (before rounding).
        half_extents: [f32; 3],
        /// Edge rounding radius.
        radius: f32,
    },
    /// Y-axis capped cylinder centered at the origin.
    Cylinder {
        /// Cylinder radius in the XZ plane.
        radius: f32,
        /// Half height along Y.
        half_height: f32,
    },
    /// Torus in the XZ plane.
    Torus {
        /// Distance from the origin to the tube center.
        major_radius: f32,
        /// Tube radius.
        minor_radius: f32,
    },
    /// Half-space `dot(p, normal) + offset <= 0`.
    Plane {
        /// Plane normal (normalized at build time).
        normal: [f32; 3],
        /// Signed offset along the normal.
        offset: f32,
    },
    /// Capsule between two points.
    Capsule {
        /// First endpoint.
        a: [f32; 3],
        /// Second endpoint.
        b: [f32; 3],
        /// Capsule radius.
        radius: f32,
    },
    /// Minimum over children.
    Union(Vec<SdfExpr>),
    /// Maximum over children.
    Intersect(Vec<SdfExpr>),
    /// First child minus the rest.
    Subtract(Vec<SdfExpr>),
    /// Polynomial smooth minimum over children.
    SmoothUnion {
        /// Blend radius.
        k: f32,
        /// Blended children.
        items: Vec<SdfExpr>,
    },
    /// Polynomial smooth maximum over children.
    SmoothIntersect {
        /// Blend radius.
        k: f32,
        /// Blended children.
        items: Vec<SdfExpr>,
    },
    /// First child smoothly minus the rest.
    SmoothSubtract {
        /// Blend radius.
        k: f32,
        /// First item minus the remaining ones.
        items: Vec<SdfExpr>,
    },
    /// Translate the child.
    Translate {
        /// World-space offset.
        offset: [f32; 3],
        /// Transformed child.
        child: Box<SdfExpr>,
    },
    /// Rotate the child around an axis through the origin.
    Rotate {
        /// Rotation axis (normalized at build time).
        axis: [f32; 3],
        /// Angle in radians.
        angle: f32,
        /// Transformed child.
        child: Box<SdfExpr>,
    },
    /// Uniformly scale the child.
    Scale {
        /// Scale factor (non-zero).
        factor: f32,
        /// Transformed child.
        child: Box<SdfExpr>,
    },
    /// Round the child surface outward.
    Round {
        /// Rounding radius.
        radius: f32,
        /// Modified child.
        child: Box<SdfExpr>,
    },
    /// Hollow the child into a shell.
    Onion {
        /// Shell half-thickness.
        thickness: f32,
        /// Modified child.
        child: Box<SdfExpr>,
    },
    /// Tag the subtree with a material id (innermost tag wins).
    Material {
        /// Material id referenced by the `materials` section.
        id: u32,
        /// Tagged child.
        child: Box<SdfExpr>,
    },
    /// Named reference into the scene library; resolved away at build time.
    #[serde(rename = "ref")]
    Ref(String),
}

/// Polynomial smooth minimum, division-free form (inv_k precomputed).
#[inline(always)]
fn smooth_min(a: f32, b: f32, k: f32, inv_k: f32) -> f32 {
    let h = (k - (a - b).abs()).max(0.0) * inv_k;
    a.min(b) - h * h * k * 0.25
}

/// Polynomial smooth maximum, division-free form.
#[inline(always)]
fn smooth_max(a: f32, b: f32, k: f32, inv_k: f32) -> f32 {
    let h = (k - (a - b).abs()).max(0.0) * inv_k;
    a.max(b) + h * h * k * 0.25
}

impl SdfExpr {
    /// Signed distance at `p`.
    ///
    /// `Ref` nodes are resolved away by the scene builder and never reach
    /// evaluation; an unresolved one evaluates to empty space.
    pub fn eval(&self, p: Vec3) -> f32 {
        match self {
            SdfExpr::Sphere { radius } => p.length() - radius,

            SdfExpr::Box3 { half_extents } => {
                let q = p.abs() - Vec3::from(*half_extents);
                q.max(Vec3::ZERO).length() + q.x.max(q.y.max(q.z)).min(0.0)
            }

            SdfExpr::RoundBox { half_extents, radius } => {
                let q = p.abs() - Vec3::from(*half_extents);
                q.max(Vec3::ZERO).length() + q.x.max(q.y.max(q.z)).min(0.0) - radius
            }

            SdfExpr::Cylinder { radius, half_height } => {
                let d = Vec2::new(
                    Vec2::new(p.x, p.z).length() - radius,
                    p.y.abs() - half_height,
                );
                d.x.max(d.y).min(0.0) + d.max(Vec2::ZERO).length()
            }

            SdfExpr::Torus { major_radius, minor_radius } => {
                let q = Vec2::new(Vec2::new(p.x, p.z).length() - major_radius, p.y);
                q.length() - minor_radius
            }

            SdfExpr::Plane { normal, offset } => p.dot(Vec3::from(*normal)) + offset,

            SdfExpr::Capsule { a, b, radius } => {
                let a = Vec3::from(*a);
                let b = Vec3::from(*b);
                let pa = p - a;
                let ba = b - a;
                let h = (pa.dot(ba) / ba.dot(ba)).clamp(0.0, 1.0);
                (pa - ba * h).length() - radius
            }

            SdfExpr::Union(items) => items
                .iter()
                .map(|e| e.eval(p))
                .fold(f32::MAX, f32::min),

            SdfExpr::Intersect(items) => items
                .iter()
                .map(|e| e.eval(p))
                .fold(f32::MIN, f32::max),

            SdfExpr::Subtract(items) => {
                let mut iter = items.iter();
                let first = iter.next().map(|e| e.eval(p)).unwrap_or(f32::MAX);
                iter.fold(first, |acc, e| acc.max(-e.eval(p)))
            }

            SdfExpr::SmoothUnion { k, items } => {
                if k.abs() < FOLD_EPSILON {
                    return SdfExpr::Union(items.clone()).eval(p);
                }
                let inv_k = 1.0 / k;
                let mut iter = items.iter();
                let first = iter.next().map(|e| e.eval(p)).unwrap_or(f32::MAX);
                iter.fold(first, |acc, e| smooth_min(acc, e.eval(p), *k, inv_k))
            }

            SdfExpr::SmoothIntersect { k, items } => {
                if k.abs() < FOLD_EPSILON {
                    return SdfExpr::Intersect(items.clone()).eval(p);
                }
                let inv_k = 1.0 / k;
                let mut iter = items.iter();
                let first = iter.next().map(|e| e.eval(p)).unwrap_or(f32::MIN);
                iter.fold(first, |acc, e| smooth_max(acc, e.eval(p), *k, inv_k))
            }

            SdfExpr::SmoothSubtract { k, items } => {
                if k.abs() < FOLD_EPSILON {
                    return SdfExpr::Subtract(items.clone()).eval(p);
                }
                let inv_k = 1.0 / k;
                let mut iter = items.iter();
                let first = iter.next().map(|e| e.eval(p)).unwrap_or(f32::MAX);
                iter.fold(first, |acc, e| smooth_max(acc, -e.eval(p), *k, inv_k))
            }

            SdfExpr::Translate { offset, child } => child.eval(p - Vec3::from(*offset)),

            SdfExpr::Rotate { axis, angle, child } => {
                let q = Quat::from_axis_angle(Vec3::from(*axis), *angle);
                child.eval(q.inverse() * p)
            }

            SdfExpr::Scale { factor, child } => child.eval(p / *factor) * factor,

            SdfExpr::Round { radius, child } => child.eval(p) - radius,

            SdfExpr::Onion { thickness, child } => child.eval(p).abs() - thickness,

            SdfExpr::Material { child, .. } => child.eval(p),

            // Refs are resolved at build time; an orphan is empty space.
            SdfExpr::Ref(_) => f32::MAX,
        }
    }

    /// Distance plus the winning material id (0 = untagged).
    ///
    /// Boolean nodes forward the id of whichever branch is closer;
    /// `Material` overrides only when the subtree below it is untagged,
    /// so the innermost tag wins.
    pub fn eval_material(&self, p: Vec3) -> (f32, u32) {
        match self {
            SdfExpr::Union(items) => items
                .iter()
                .map(|e| e.eval_material(p))
                .fold((f32::MAX, 0), |acc, cur| if cur.0 < acc.0 { cur } else { acc }),

            SdfExpr::Intersect(items) => items
                .iter()
                .map(|e| e.eval_material(p))
                .fold((f32::MIN, 0), |acc, cur| if cur.0 > acc.0 { cur } else { acc }),

            SdfExpr::Subtract(items) | SdfExpr::SmoothSubtract { items, .. } => {
                // Carved-away material never shows; keep the base branch id.
                let d = self.eval(p);
                let id = items
                    .first()
                    .map(|e| e.eval_material(p).1)
                    .unwrap_or(0);
                (d, id)
            }

            SdfExpr::SmoothUnion { items, .. } => {
                let d = self.eval(p);
                let id = items
                    .iter()
                    .map(|e| e.eval_material(p))
                    .fold((f32::MAX, 0), |acc, cur| if cur.0 < acc.0 { cur } else { acc })
                    .1;
                (d, id)
            }

            SdfExpr::SmoothIntersect { items, .. } => {
                let d = self.eval(p);
                let id = items
                    .iter()
                    .map(|e| e.eval_material(p))
                    .fold((f32::MIN, 0), |acc, cur| if cur.0 > acc.0 { cur } else { acc })
                    .1;
                (d, id)
            }

            SdfExpr::Translate { offset, child } => {
                child.eval_material(p - Vec3::from(*offset))
            }

            SdfExpr::Rotate { axis, angle, child } => {
                let q = Quat::from_axis_angle(Vec3::from(*axis), *angle);
                child.eval_material(q.inverse() * p)
            }

            SdfExpr::Scale { factor, child } => {
                let (d, id) = child.eval_material(p / *factor);
                (d * factor, id)
            }

            SdfExpr::Round { radius, child } => {
                let (d, id) = child.eval_material(p);
                (d - radius, id)
            }

            SdfExpr::Onion { thickness, child } => {
                let (d, id) = child.eval_material(p);
                (d.abs() - thickness, id)
            }

            SdfExpr::Material { id, child } => {
                let (d, inner) = child.eval_material(p);
                (d, if inner != 0 { inner } else { *id })
            }

            _ => (self.eval(p), 0),
        }
    }

    /// Visit every node mutably, parents before children.
    pub(crate) fn for_each_mut(&mut self, f: &mut impl FnMut(&mut SdfExpr)) {
        f(self);
        match self {
            SdfExpr::Union(items)
            | SdfExpr::Intersect(items)
            | SdfExpr::Subtract(items)
            | SdfExpr::SmoothUnion { items, .. }
            | SdfExpr::SmoothIntersect { items, .. }
            | SdfExpr::SmoothSubtract { items, .. } => {
                for item in items {
                    item.for_each_mut(f);
                }
            }
            SdfExpr::Translate { child, .. }
            | SdfExpr::Rotate { child, .. }
            | SdfExpr::Scale { child, .. }
            | SdfExpr::Round { child, .. }
            | SdfExpr::Onion { child, .. }
            | SdfExpr::Material { child, .. } => child.for_each_mut(f),
            _ => {}
        }
    }

    /// Visit every node, children after transforms resolve.
    pub(crate) fn for_each(&self, f: &mut impl FnMut(&SdfExpr)) {
        f(self);
        match self {
            SdfExpr::Union(items)
            | SdfExpr::Intersect(items)
            | SdfExpr::Subtract(items)
            | SdfExpr::SmoothUnion { items, .. }
            | SdfExpr::SmoothIntersect { items, .. }
            | SdfExpr::SmoothSubtract { items, .. } => {
                for item in items {
                    item.for_each(f);
                }
            }
            SdfExpr::Translate { child, .. }
            | SdfExpr::Rotate { child, .. }
            | SdfExpr::Scale { child, .. }
            | SdfExpr::Round { child, .. }
            | SdfExpr::Onion { child, .. }
            | SdfExpr::Material { child, .. } => child.for_each(f),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sphere_distance() {
        let s = SdfExpr::Sphere { radius: 1.0 };
        assert!((s.eval(Vec3::ZERO) + 1.0).abs() < 1e-6);
        assert!((s.eval(Vec3::new(2.0, 0.0, 0.0)) - 1.0).abs() < 1e-6);
        assert!(s.eval(Vec3::X).abs() < 1e-6);
    }

    #[test]
    fn test_box_corner_distance() {
        let b = SdfExpr::Box3 { half_extents: [1.0, 1.0, 1.0] };
        let d = b.eval(Vec3::splat(2.0));
        assert!((d - 3.0f32.sqrt()).abs() < 1e-5);
        assert!(b.eval(Vec3::ZERO) < 0.0);
    }

    #[test]
    fn test_subtract_carves() {
        let shape = SdfExpr::Subtract(vec![
            SdfExpr::Sphere { radius: 1.0 },
            SdfExpr::Sphere { radius: 0.5 },
        ]);
        // Center is inside the carved hole
        assert!(shape.eval(Vec3::ZERO) > 0.0);
        // Shell midpoint is solid
        assert!(shape.eval(Vec3::new(0.75, 0.0, 0.0)) < 0.0);
    }

    #[test]
    fn test_smooth_union_bridges() {
        let a = SdfExpr::Translate {
            offset: [-0.6, 0.0, 0.0],
            child: Box::new(SdfExpr::Sphere { radius: 0.5 }),
        };
        let b = SdfExpr::Translate {
            offset: [0.6, 0.0, 0.0],
            child: Box::new(SdfExpr::Sphere { radius: 0.5 }),
        };
        let hard = SdfExpr::Union(vec![a.clone(), b.clone()]);
        let smooth = SdfExpr::SmoothUnion { k: 0.4, items: vec![a, b] };
        // Smooth blend pulls the midpoint closer to the surface
        assert!(smooth.eval(Vec3::ZERO) < hard.eval(Vec3::ZERO));
    }

    #[test]
    fn test_scale_preserves_metric() {
        let s = SdfExpr::Scale {
            factor: 2.0,
            child: Box::new(SdfExpr::Sphere { radius: 1.0 }),
        };
        // Scaled sphere has radius 2
        assert!((s.eval(Vec3::new(3.0, 0.0, 0.0)) - 1.0).abs() < 1e-5);
        assert!(s.eval(Vec3::new(2.0, 0.0, 0.0)).abs() < 1e-5);
    }

    #[test]
    fn test_rotate_moves_surface() {
        let c = SdfExpr::Rotate {
            axis: [0.0, 0.0, 1.0],
            angle: std::f32::consts::FRAC_PI_2,
            child: Box::new(SdfExpr::Cylinder { radius: 0.2, half_height: 1.0 }),
        };
        // Cylinder axis now along X: a point on +X near the old cap is inside
        assert!(c.eval(Vec3::new(0.9, 0.0, 0.0)) < 0.0);
        assert!(c.eval(Vec3::new(0.0, 0.9, 0.0)) > 0.0);
    }

    #[test]
    fn test_innermost_material_wins() {
        let shape = SdfExpr::Material {
            id: 1,
            child: Box::new(SdfExpr::Union(vec![
                SdfExpr::Material {
                    id: 2,
                    child: Box::new(SdfExpr::Sphere { radius: 0.5 }),
                },
                SdfExpr::Translate {
                    offset: [2.0, 0.0, 0.0],
                    child: Box::new(SdfExpr::Sphere { radius: 0.5 }),
                },
            ])),
        };
        // Near the tagged inner sphere: id 2
        assert_eq!(shape.eval_material(Vec3::ZERO).1, 2);
        // Near the untagged sphere: outer tag 1 applies
        assert_eq!(shape.eval_material(Vec3::new(2.0, 0.0, 0.0)).1, 1);
    }

    #[test]
    fn test_serde_round_trip() {
        let json = r#"{"subtract": [
            {"sphere": {"radius": 1.0}},
            {"translate": {"offset": [0.5, 0.0, 0.0],
                           "child": {"box": {"half_extents": [0.3, 0.3, 0.3]}}}}
        ]}"#;
        let expr: SdfExpr = serde_json::from_str(json).unwrap();
        assert!(matches!(expr, SdfExpr::Subtract(ref items) if items.len() == 2));
        let back = serde_json::to_string(&expr).unwrap();
        let again: SdfExpr = serde_json::from_str(&back).unwrap();
        assert_eq!(expr, again);
    }
}
