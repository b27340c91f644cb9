use crate::config::SurfaceOptions;
use crate::error::ReconError;
use crate::filters::gaussian_smooth;
use crate::mesh::{IndexSpace, Mesh, RenderSpace};
use crate::volume::{Geometry, Mask};

use nalgebra::Vector3;
use ndarray::{Array3, s};
use tracing::debug;

/// Zero border added around the cropped mask so every surface closes.
const PAD: usize = 2;
const NO_VERTEX: u32 = u32::MAX;

/// Unit cube corners as `(x, y, z)` offsets.
const CORNERS: [(usize, usize, usize); 8] = [
    (0, 0, 0),
    (1, 0, 0),
    (1, 1, 0),
    (0, 1, 0),
    (0, 0, 1),
    (1, 0, 1),
    (1, 1, 1),
    (0, 1, 1),
];

const EDGES: [(usize, usize); 12] = [
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 0),
    (4, 5),
    (5, 6),
    (6, 7),
    (7, 4),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

pub struct SurfaceExtractor {
    options: SurfaceOptions,
}

impl SurfaceExtractor {
    pub fn new(options: SurfaceOptions) -> Self {
        Self { options }
    }

    /// Extract the boundary of `mask` as an outward-wound mesh in render space.
    pub fn extract(&self, mask: &Mask) -> Result<Mesh<RenderSpace>, ReconError> {
        let empty = || ReconError::SegmentationEmpty {
            tissue: mask.tissue(),
        };
        let geometry = mask.geometry();
        let (start, field) = self.prepare_field(mask).ok_or_else(empty)?;

        let mesh = surface_nets(&field, self.options.iso_level);
        if mesh.is_empty() {
            return Err(empty());
        }
        debug!(
            tissue = %mask.tissue(),
            vertices = mesh.vertex_count(),
            faces = mesh.face_count(),
            "Surface nets"
        );

        let offset = Vector3::new(start[2] as f64, start[1] as f64, start[0] as f64) - Vector3::repeat(PAD as f64);
        let mut mesh = bake(mesh, geometry, &offset, self.options.unit_scale);
        if mesh.signed_volume() < 0.0 {
            mesh.flip_faces();
        }
        Ok(mesh)
    }

    /// Crop to the mask bounding box plus margin, pad, and blur into a
    /// scalar field. Returns the `[z, y, x]` crop start alongside.
    fn prepare_field(&self, mask: &Mask) -> Option<([usize; 3], Array3<f32>)> {
        let data = mask.data();
        let dim = [data.dim().0, data.dim().1, data.dim().2];
        let mut lo = dim;
        let mut hi = [0usize; 3];
        for ((z, y, x), &set) in data.indexed_iter() {
            if set {
                for (axis, i) in [z, y, x].into_iter().enumerate() {
                    lo[axis] = lo[axis].min(i);
                    hi[axis] = hi[axis].max(i + 1);
                }
            }
        }
        if hi[0] == 0 {
            return None;
        }

        // spacing is (x, y, z); crop axes are (z, y, x)
        let spacing = mask.geometry().spacing();
        let margin: [usize; 3] = std::array::from_fn(|axis| {
            (self.options.crop_margin / spacing[2 - axis]).ceil().max(0.0) as usize
        });
        let start: [usize; 3] = std::array::from_fn(|a| lo[a].saturating_sub(margin[a]));
        let end: [usize; 3] = std::array::from_fn(|a| (hi[a] + margin[a]).min(dim[a]));

        let cropped = data.slice(s![start[0]..end[0], start[1]..end[1], start[2]..end[2]]);
        let (d, h, w) = cropped.dim();
        let mut field = Array3::<f32>::zeros((d + 2 * PAD, h + 2 * PAD, w + 2 * PAD));
        field
            .slice_mut(s![PAD..PAD + d, PAD..PAD + h, PAD..PAD + w])
            .zip_mut_with(&cropped, |f, &m| *f = if m { 1.0 } else { 0.0 });

        if self.options.blur_sigma > 0.0 {
            field = gaussian_smooth(&field, &Vector3::repeat(self.options.blur_sigma));
        }
        Some((start, field))
    }
}

/// Naive Surface Nets on a `[z, y, x]` field that is above `iso` inside.
/// Faces are wound with their normal toward decreasing field value.
pub(crate) fn surface_nets(field: &Array3<f32>, iso: f32) -> Mesh<IndexSpace> {
    let (nz, ny, nx) = field.dim();
    if nz < 2 || ny < 2 || nx < 2 {
        return Mesh::<IndexSpace>::new(Vec::new(), Vec::new());
    }
    let value = |x: usize, y: usize, z: usize| field[[z, y, x]] - iso;

    let mut cells = Array3::<u32>::from_elem((nz - 1, ny - 1, nx - 1), NO_VERTEX);
    let mut vertices = Vec::new();
    for cz in 0..nz - 1 {
        for cy in 0..ny - 1 {
            for cx in 0..nx - 1 {
                let values: [f32; 8] = std::array::from_fn(|i| {
                    let (dx, dy, dz) = CORNERS[i];
                    value(cx + dx, cy + dy, cz + dz)
                });
                let inside = values.iter().filter(|&&v| v > 0.0).count();
                if inside == 0 || inside == 8 {
                    continue;
                }

                let mut sum = Vector3::zeros();
                let mut count = 0;
                for &(i, j) in &EDGES {
                    let (vi, vj) = (values[i], values[j]);
                    if (vi > 0.0) != (vj > 0.0) {
                        let t = (vi / (vi - vj)) as f64;
                        let (ci, cj) = (CORNERS[i], CORNERS[j]);
                        let pi = Vector3::new(ci.0 as f64, ci.1 as f64, ci.2 as f64);
                        let pj = Vector3::new(cj.0 as f64, cj.1 as f64, cj.2 as f64);
                        sum += pi.lerp(&pj, t);
                        count += 1;
                    }
                }
                cells[[cz, cy, cx]] = vertices.len() as u32;
                vertices.push(Vector3::new(cx as f64, cy as f64, cz as f64) + sum / count as f64);
            }
        }
    }

    let mut faces = Vec::new();
    let mut quad = |cells_around: [(usize, usize, usize); 4], outward_positive: bool| {
        let ids = cells_around.map(|(x, y, z)| cells[[z, y, x]]);
        if ids.contains(&NO_VERTEX) {
            return;
        }
        let [a, b, c, d] = ids;
        if outward_positive {
            faces.push([a, b, c]);
            faces.push([a, c, d]);
        } else {
            faces.push([a, c, b]);
            faces.push([a, d, c]);
        }
    };

    // Each grid edge crossing the iso level emits the quad of its four
    // surrounding cells. For the listed cell order, `a b c` faces +x, -y and
    // +z respectively.
    for z in 1..nz - 1 {
        for y in 1..ny - 1 {
            for x in 0..nx - 1 {
                let (v0, v1) = (value(x, y, z), value(x + 1, y, z));
                if (v0 > 0.0) != (v1 > 0.0) {
                    quad([(x, y - 1, z - 1), (x, y, z - 1), (x, y, z), (x, y - 1, z)], v0 > 0.0);
                }
            }
        }
    }
    for z in 1..nz - 1 {
        for y in 0..ny - 1 {
            for x in 1..nx - 1 {
                let (v0, v1) = (value(x, y, z), value(x, y + 1, z));
                if (v0 > 0.0) != (v1 > 0.0) {
                    quad([(x - 1, y, z - 1), (x, y, z - 1), (x, y, z), (x - 1, y, z)], v0 <= 0.0);
                }
            }
        }
    }
    for z in 0..nz - 1 {
        for y in 1..ny - 1 {
            for x in 1..nx - 1 {
                let (v0, v1) = (value(x, y, z), value(x, y, z + 1));
                if (v0 > 0.0) != (v1 > 0.0) {
                    quad([(x - 1, y - 1, z), (x, y - 1, z), (x, y, z), (x - 1, y, z)], v0 > 0.0);
                }
            }
        }
    }

    Mesh::<IndexSpace>::new(vertices, faces)
}

/// Index space to render space: crop offset, spacing, direction and origin
/// into patient LPS millimetres, then `(-x, z, y)` scaled by `unit_scale`.
fn bake(
    mesh: Mesh<IndexSpace>,
    geometry: &Geometry,
    offset: &Vector3<f64>,
    unit_scale: f64,
) -> Mesh<RenderSpace> {
    mesh.into_render_space(|v| {
        let p = geometry.index_to_physical(&(v + offset));
        Vector3::new(-p.x, p.z, p.y) * unit_scale
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Tissue;

    fn sphere_mask(radius: f64, origin: Vector3<f64>) -> Mask {
        let geometry = Geometry::axis_aligned(Vector3::repeat(1.0), origin).unwrap();
        let data = Array3::from_shape_fn((32, 32, 32), |(z, y, x)| {
            let d = Vector3::new(x as f64, y as f64, z as f64) - Vector3::repeat(15.5);
            d.norm() < radius
        });
        Mask::new(data, geometry, Tissue::Bone)
    }

    fn extractor() -> SurfaceExtractor {
        SurfaceExtractor::new(SurfaceOptions::default())
    }

    #[test]
    fn sphere_vertices_lie_on_radius() {
        let origin = Vector3::new(5.0, -3.0, 2.0);
        let mesh = extractor().extract(&sphere_mask(10.0, origin)).unwrap();
        assert!(mesh.is_valid());
        assert!(mesh.signed_volume() > 0.0);

        let c = origin + Vector3::repeat(15.5);
        let centre = Vector3::new(-c.x, c.z, c.y) * 0.001;
        for v in mesh.vertices() {
            let d = (v - centre).norm();
            assert!((d - 0.010).abs() < 0.0015, "vertex at distance {d}");
        }
    }

    #[test]
    fn extent_is_in_metres() {
        let mesh = extractor().extract(&sphere_mask(10.0, Vector3::zeros())).unwrap();
        let (min, max) = mesh.bounds().unwrap();
        let extent = max - min;
        for axis in 0..3 {
            assert!(extent[axis] > 0.017 && extent[axis] < 0.023, "extent {extent}");
        }
    }

    #[test]
    fn lps_x_maps_to_negative_render_x() {
        let geometry = Geometry::axis_aligned(Vector3::repeat(1.0), Vector3::zeros()).unwrap();
        let data = Array3::from_shape_fn((16, 16, 32), |(z, y, x)| {
            (5..11).contains(&z) && (5..11).contains(&y) && (22..28).contains(&x)
        });
        let mesh = extractor()
            .extract(&Mask::new(data, geometry, Tissue::Bone))
            .unwrap();
        let (min, max) = mesh.bounds().unwrap();
        assert!(max.x < -0.015 && min.x > -0.030);
        assert!(min.y > 0.0 && min.z > 0.0);
    }

    #[test]
    fn empty_mask_is_rejected() {
        let geometry = Geometry::axis_aligned(Vector3::repeat(1.0), Vector3::zeros()).unwrap();
        let mask = Mask::new(Array3::from_elem((4, 4, 4), false), geometry, Tissue::Muscle);
        assert!(matches!(
            extractor().extract(&mask),
            Err(ReconError::SegmentationEmpty {
                tissue: Tissue::Muscle
            })
        ));
    }

    #[test]
    fn unblurred_cube_winds_outward() {
        let mut field = Array3::<f32>::zeros((6, 6, 6));
        field.slice_mut(s![2..4, 2..4, 2..4]).fill(1.0);
        let mesh = surface_nets(&field, 0.5);
        let (vertices, faces) = mesh.into_parts();
        let rendered = Mesh::<RenderSpace>::new(vertices, faces);
        assert!(rendered.is_valid());
        assert!(rendered.signed_volume() > 0.0);
    }
}
