//! Mesh output buffers (Deep Fried Edition)
//!
//! # Deep Fried Optimizations
//! - **Rebase-and-append merge**: Sub-meshes concatenate with a single index
//!   offset, no per-vertex work.
//! - **Quantized weld**: Optional vertex dedup via integer-quantized hashing,
//!   no float comparisons.
//!
//! Author: Moroya Sakamoto

use glam::Vec3;
use thiserror::Error;

/// Vertex with position and normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    /// Position in world space.
    pub position: Vec3,
    /// Surface normal (unit length for interpolating engines).
    pub normal: Vec3,
}

impl Vertex {
    /// Create a new vertex.
    #[inline]
    pub fn new(position: Vec3, normal: Vec3) -> Self {
        Vertex { position, normal }
    }
}

/// Structural defect found by [`MeshBuffer::validate`].
#[derive(Debug, Error)]
pub enum MeshError {
    /// Index count is not a multiple of three.
    #[error("index count {0} is not a multiple of 3")]
    RaggedTriangles(usize),
    /// An index points past the vertex buffer.
    #[error("index {index} out of range ({vertices} vertices)")]
    IndexOutOfRange {
        /// The offending index value.
        index: u32,
        /// Vertex count at validation time.
        vertices: usize,
    },
    /// Color buffer length disagrees with the vertex buffer.
    #[error("color count {colors} != vertex count {vertices}")]
    ColorCountMismatch {
        /// Number of colors present.
        colors: usize,
        /// Number of vertices present.
        vertices: usize,
    },
}

/// Indexed triangle mesh with optional per-vertex colors.
///
/// The contract with exporter/viewer collaborators is exactly this type:
/// `indices.len() % 3 == 0`, every index in range, and when colors are
/// present there is exactly one per vertex.
#[derive(Debug, Clone, Default)]
pub struct MeshBuffer {
    /// Vertex buffer.
    pub vertices: Vec<Vertex>,
    /// Triangle indices, three per face.
    pub indices: Vec<u32>,
    /// Per-vertex linear RGB, if a color pass ran.
    pub colors: Option<Vec<Vec3>>,
}

impl MeshBuffer {
    /// Create an empty mesh.
    pub fn new() -> Self {
        MeshBuffer::default()
    }

    /// Number of vertices.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of triangles.
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Whether the mesh has no geometry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Whether a color channel is present, for collaborators that must
    /// pick an output encoding up front.
    #[inline]
    pub fn has_colors(&self) -> bool {
        self.colors.is_some()
    }

    /// Check the structural invariants exporters rely on.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.indices.len() % 3 != 0 {
            return Err(MeshError::RaggedTriangles(self.indices.len()));
        }
        let n = self.vertices.len();
        for &i in &self.indices {
            if i as usize >= n {
                return Err(MeshError::IndexOutOfRange { index: i, vertices: n });
            }
        }
        if let Some(colors) = &self.colors {
            if colors.len() != n {
                return Err(MeshError::ColorCountMismatch {
                    colors: colors.len(),
                    vertices: n,
                });
            }
        }
        Ok(())
    }

    /// Merge sub-meshes in order, rebasing indices by the running vertex
    /// count. Colors are carried only when every sub-mesh has them.
    pub fn merge(sub_meshes: Vec<MeshBuffer>) -> MeshBuffer {
        let total_vertices: usize = sub_meshes.iter().map(|m| m.vertices.len()).sum();
        let total_indices: usize = sub_meshes.iter().map(|m| m.indices.len()).sum();
        let all_colored = !sub_meshes.is_empty() && sub_meshes.iter().all(|m| m.colors.is_some());

        let mut merged = MeshBuffer {
            vertices: Vec::with_capacity(total_vertices),
            indices: Vec::with_capacity(total_indices),
            colors: if all_colored {
                Some(Vec::with_capacity(total_vertices))
            } else {
                None
            },
        };

        for sub in sub_meshes {
            let base_idx = merged.vertices.len() as u32;
            merged.vertices.extend(sub.vertices);
            merged.indices.extend(sub.indices.iter().map(|i| i + base_idx));
            if let (Some(dst), Some(src)) = (merged.colors.as_mut(), sub.colors) {
                dst.extend(src);
            }
        }

        merged
    }

    /// Deduplicate coincident vertices and remap indices.
    ///
    /// Positions quantized at 1e-4 and normals at 1e-3 hash to the same
    /// slot; seam-duplicated vertices from chunked extraction collapse
    /// here, making shared-index watertightness checks possible.
    pub fn weld(&mut self) {
        use std::collections::HashMap;

        let mut vertex_map: HashMap<u64, u32> = HashMap::new();
        let mut new_vertices = Vec::new();
        let mut new_colors = self.colors.as_ref().map(|_| Vec::new());
        let mut index_remap: Vec<u32> = Vec::with_capacity(self.vertices.len());

        for (vi, v) in self.vertices.iter().enumerate() {
            let key = hash_vertex(v);
            if let Some(&new_idx) = vertex_map.get(&key) {
                index_remap.push(new_idx);
            } else {
                let new_idx = new_vertices.len() as u32;
                vertex_map.insert(key, new_idx);
                new_vertices.push(*v);
                if let (Some(dst), Some(src)) = (new_colors.as_mut(), self.colors.as_ref()) {
                    dst.push(src[vi]);
                }
                index_remap.push(new_idx);
            }
        }

        for idx in &mut self.indices {
            *idx = index_remap[*idx as usize];
        }

        self.vertices = new_vertices;
        self.colors = new_colors;
    }
}

fn hash_vertex(v: &Vertex) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();

    // Quantize to avoid floating point issues
    let qp = [
        (v.position.x * 10000.0) as i32,
        (v.position.y * 10000.0) as i32,
        (v.position.z * 10000.0) as i32,
    ];
    let qn = [
        (v.normal.x * 1000.0) as i32,
        (v.normal.y * 1000.0) as i32,
        (v.normal.z * 1000.0) as i32,
    ];

    qp.hash(&mut hasher);
    qn.hash(&mut hasher);

    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri(offset: Vec3) -> MeshBuffer {
        MeshBuffer {
            vertices: vec![
                Vertex::new(offset, Vec3::Y),
                Vertex::new(offset + Vec3::X, Vec3::Y),
                Vertex::new(offset + Vec3::Z, Vec3::Y),
            ],
            indices: vec![0, 1, 2],
            colors: None,
        }
    }

    #[test]
    fn test_merge_rebases_indices() {
        let merged = MeshBuffer::merge(vec![tri(Vec3::ZERO), tri(Vec3::splat(5.0))]);
        assert_eq!(merged.vertex_count(), 6);
        assert_eq!(merged.indices, vec![0, 1, 2, 3, 4, 5]);
        assert!(merged.validate().is_ok());
    }

    #[test]
    fn test_merge_drops_partial_colors() {
        let mut a = tri(Vec3::ZERO);
        a.colors = Some(vec![Vec3::ONE; 3]);
        let b = tri(Vec3::X);
        let merged = MeshBuffer::merge(vec![a, b]);
        assert!(!merged.has_colors());
    }

    #[test]
    fn test_weld_collapses_duplicates() {
        // Two triangles sharing an edge, emitted as 6 separate vertices
        let mut mesh = MeshBuffer {
            vertices: vec![
                Vertex::new(Vec3::ZERO, Vec3::Y),
                Vertex::new(Vec3::X, Vec3::Y),
                Vertex::new(Vec3::Z, Vec3::Y),
                Vertex::new(Vec3::X, Vec3::Y),
                Vertex::new(Vec3::new(1.0, 0.0, 1.0), Vec3::Y),
                Vertex::new(Vec3::Z, Vec3::Y),
            ],
            indices: vec![0, 1, 2, 3, 4, 5],
            colors: None,
        };
        mesh.weld();
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.triangle_count(), 2);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_weld_preserves_colors() {
        let mut mesh = MeshBuffer {
            vertices: vec![
                Vertex::new(Vec3::ZERO, Vec3::Y),
                Vertex::new(Vec3::ZERO, Vec3::Y),
                Vertex::new(Vec3::X, Vec3::Y),
            ],
            indices: vec![0, 1, 2],
            colors: Some(vec![Vec3::ONE, Vec3::ONE, Vec3::ZERO]),
        };
        mesh.weld();
        assert_eq!(mesh.vertex_count(), 2);
        assert_eq!(mesh.colors.as_ref().map(|c| c.len()), Some(2));
    }

    #[test]
    fn test_validate_catches_bad_index() {
        let mut mesh = tri(Vec3::ZERO);
        mesh.indices[1] = 9;
        assert!(matches!(
            mesh.validate(),
            Err(MeshError::IndexOutOfRange { index: 9, .. })
        ));
    }

    #[test]
    fn test_validate_catches_color_mismatch() {
        let mut mesh = tri(Vec3::ZERO);
        mesh.colors = Some(vec![Vec3::ONE]);
        assert!(matches!(mesh.validate(), Err(MeshError::ColorCountMismatch { .. })));
    }
}
