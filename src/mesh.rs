//! Triangle meshes tagged with the coordinate space their vertices live in.
//!
//! Surfaces are extracted in voxel index space and baked into render space
//! exactly once. The marker type makes a second bake a compile error.

use crate::enums::Tissue;

use nalgebra::Vector3;
use serde::Serialize;
use std::marker::PhantomData;
use std::ops::Range;

/// Vertices in voxel index space of a (cropped) mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexSpace;

/// Vertices in the display frame: `(-x, z, y)` of patient LPS, in metres.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSpace;

#[derive(Clone, Debug, PartialEq)]
pub struct Mesh<S> {
    vertices: Vec<Vector3<f64>>,
    faces: Vec<[u32; 3]>,
    normals: Option<Vec<Vector3<f64>>>,
    space: PhantomData<S>,
}

impl<S> Mesh<S> {
    pub fn vertices(&self) -> &[Vector3<f64>] {
        &self.vertices
    }

    pub fn faces(&self) -> &[[u32; 3]] {
        &self.faces
    }

    /// Per-vertex normals, once computed.
    pub fn normals(&self) -> Option<&[Vector3<f64>]> {
        self.normals.as_deref()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Every face references three distinct, existing vertices.
    pub fn is_valid(&self) -> bool {
        let n = self.vertices.len();
        self.faces.iter().all(|f| {
            f.iter().all(|&i| (i as usize) < n) && f[0] != f[1] && f[1] != f[2] && f[0] != f[2]
        }) && self
            .normals
            .as_ref()
            .is_none_or(|normals| normals.len() == n)
    }

    /// Axis-aligned bounds, `None` for a mesh without vertices.
    pub fn bounds(&self) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let first = self.vertices.first()?;
        Some(self.vertices.iter().fold((*first, *first), |(min, max), v| {
            (min.inf(v), max.sup(v))
        }))
    }

    /// Enclosed volume by the divergence theorem. Positive for outward winding.
    pub fn signed_volume(&self) -> f64 {
        self.faces
            .iter()
            .map(|f| {
                let [a, b, c] = f.map(|i| self.vertices[i as usize]);
                a.dot(&b.cross(&c)) / 6.0
            })
            .sum()
    }

    pub fn into_parts(self) -> (Vec<Vector3<f64>>, Vec<[u32; 3]>) {
        (self.vertices, self.faces)
    }
}

impl Mesh<IndexSpace> {
    pub(crate) fn new(vertices: Vec<Vector3<f64>>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            faces,
            normals: None,
            space: PhantomData,
        }
    }

    /// Consume the index-space mesh, mapping each vertex once.
    pub(crate) fn into_render_space(
        self,
        transform: impl Fn(&Vector3<f64>) -> Vector3<f64>,
    ) -> Mesh<RenderSpace> {
        Mesh {
            vertices: self.vertices.iter().map(transform).collect(),
            faces: self.faces,
            normals: None,
            space: PhantomData,
        }
    }
}

impl Mesh<RenderSpace> {
    pub fn new(vertices: Vec<Vector3<f64>>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            faces,
            normals: None,
            space: PhantomData,
        }
    }

    pub fn with_normals(mut self, normals: Vec<Vector3<f64>>) -> Self {
        self.normals = Some(normals);
        self
    }

    /// Reverse the winding of every face.
    pub fn flip_faces(&mut self) {
        for face in &mut self.faces {
            face.swap(1, 2);
        }
        if let Some(normals) = &mut self.normals {
            normals.iter_mut().for_each(|n| *n = -*n);
        }
    }

    /// Area-weighted vertex normals.
    pub fn compute_normals(&mut self) {
        let mut normals = vec![Vector3::zeros(); self.vertices.len()];
        for face in &self.faces {
            let [a, b, c] = face.map(|i| self.vertices[i as usize]);
            let weighted = (b - a).cross(&(c - a));
            for &i in face {
                normals[i as usize] += weighted;
            }
        }
        for n in &mut normals {
            *n = n.try_normalize(f64::EPSILON).unwrap_or_else(Vector3::z);
        }
        self.normals = Some(normals);
    }
}

/// Faces and vertices contributed by one tissue to a [`MeshAsset`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TissueGroup {
    pub tissue: Tissue,
    pub vertices: Range<usize>,
    pub faces: Range<usize>,
}

/// All tissue meshes of one reconstruction, concatenated, with a per-face
/// tissue attribution.
#[derive(Clone, Debug)]
pub struct MeshAsset {
    mesh: Mesh<RenderSpace>,
    groups: Vec<TissueGroup>,
}

impl MeshAsset {
    /// Concatenate per-tissue meshes; normals are kept only if every part has them.
    pub fn merge(parts: Vec<(Tissue, Mesh<RenderSpace>)>) -> Self {
        let with_normals = parts.iter().all(|(_, m)| m.normals.is_some());
        let mut vertices = Vec::new();
        let mut faces = Vec::new();
        let mut normals = Vec::new();
        let mut groups = Vec::with_capacity(parts.len());

        for (tissue, part) in parts {
            let vertex_start = vertices.len();
            let face_start = faces.len();
            let base = vertex_start as u32;
            faces.extend(part.faces.iter().map(|f| f.map(|i| i + base)));
            vertices.extend(part.vertices);
            if let Some(n) = part.normals {
                normals.extend(n);
            }
            groups.push(TissueGroup {
                tissue,
                vertices: vertex_start..vertices.len(),
                faces: face_start..faces.len(),
            });
        }

        let mut mesh = Mesh::<RenderSpace>::new(vertices, faces);
        if with_normals {
            mesh.normals = Some(normals);
        }
        Self { mesh, groups }
    }

    pub fn mesh(&self) -> &Mesh<RenderSpace> {
        &self.mesh
    }

    pub fn groups(&self) -> &[TissueGroup] {
        &self.groups
    }

    /// Tissue that produced the face at `index`.
    pub fn face_tissue(&self, index: usize) -> Option<Tissue> {
        self.groups
            .iter()
            .find(|g| g.faces.contains(&index))
            .map(|g| g.tissue)
    }

    /// Vertices and faces of one group, re-indexed from zero.
    pub fn group_mesh(&self, group: &TissueGroup) -> (Vec<Vector3<f64>>, Vec<[u32; 3]>) {
        let base = group.vertices.start as u32;
        let vertices = self.mesh.vertices[group.vertices.clone()].to_vec();
        let faces = self.mesh.faces[group.faces.clone()]
            .iter()
            .map(|f| f.map(|i| i - base))
            .collect();
        (vertices, faces)
    }

    pub fn is_empty(&self) -> bool {
        self.mesh.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Outward-wound unit tetrahedron.
    pub(crate) fn tetrahedron() -> Mesh<RenderSpace> {
        Mesh::<RenderSpace>::new(
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.0, 1.0, 0.0),
                Vector3::new(0.0, 0.0, 1.0),
            ],
            vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
        )
    }

    #[test]
    fn tetrahedron_volume_is_positive() {
        let mesh = tetrahedron();
        assert!(mesh.is_valid());
        assert!((mesh.signed_volume() - 1.0 / 6.0).abs() < 1e-12);
        let mut flipped = mesh.clone();
        flipped.flip_faces();
        assert!(flipped.signed_volume() < 0.0);
    }

    #[test]
    fn render_bake_maps_every_vertex_once() {
        let mesh = Mesh::<IndexSpace>::new(vec![Vector3::new(1.0, 2.0, 3.0)], Vec::new());
        let baked = mesh.into_render_space(|v| v * 2.0);
        assert_eq!(baked.vertices()[0], Vector3::new(2.0, 4.0, 6.0));
    }

    #[test]
    fn normals_point_outward() {
        let mut mesh = tetrahedron();
        mesh.compute_normals();
        let normals = mesh.normals().unwrap();
        assert!(normals[3].z > 0.0);
        assert!(normals[0].x < 0.0 && normals[0].y < 0.0 && normals[0].z < 0.0);
        assert!(mesh.is_valid());
    }

    #[test]
    fn merge_offsets_indices_and_tracks_tissue() {
        let asset = MeshAsset::merge(vec![
            (Tissue::Bone, tetrahedron()),
            (Tissue::Muscle, tetrahedron()),
        ]);
        assert_eq!(asset.mesh().vertex_count(), 8);
        assert_eq!(asset.mesh().faces()[4], [4, 6, 5]);
        assert_eq!(asset.face_tissue(2), Some(Tissue::Bone));
        assert_eq!(asset.face_tissue(7), Some(Tissue::Muscle));
        assert_eq!(asset.face_tissue(8), None);
        let (vertices, faces) = asset.group_mesh(&asset.groups()[1]);
        assert_eq!(vertices.len(), 4);
        assert_eq!(faces[0], [0, 2, 1]);
    }

    #[test]
    fn bounds_cover_all_vertices() {
        let (min, max) = tetrahedron().bounds().unwrap();
        assert_eq!(min, Vector3::zeros());
        assert_eq!(max, Vector3::repeat(1.0));
    }
}
