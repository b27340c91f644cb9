use dicom_mesh::config::{ClassifierOptions, FinishingOptions, SequencerOptions, StandardizerOptions};
use dicom_mesh::volume::is_orthonormal;
use dicom_mesh::{Mesh, MeshFinisher, RenderSpace, Slice, SliceSequencer, StackClassifier, VolumeStandardizer};
use nalgebra::{Rotation3, Vector3};
use ndarray::Array2;
use proptest::prelude::*;

/// A small stack in an arbitrary rotated frame.
fn rotated_stack(rotation: &Rotation3<f64>, origin: Vector3<f64>, spacing: f64) -> Vec<Slice> {
    let row = rotation * Vector3::x();
    let column = rotation * Vector3::y();
    let normal = rotation * Vector3::z();
    (0..6)
        .map(|k| {
            let pixels = Array2::from_shape_fn((8, 10), |(r, c)| (r * 10 + c + k) as f32);
            Slice::new(pixels)
                .with_pixel_spacing(1.0, 1.0)
                .with_position(origin + normal * (k as f64 * spacing))
                .with_orientation(row, column)
                .with_acquisition_index(k as i32)
        })
        .collect()
}

/// Closed UV sphere with single-vertex poles.
fn uv_sphere(radius: f64, rings: u32, segments: u32) -> Mesh<RenderSpace> {
    let mut vertices = vec![Vector3::new(0.0, 0.0, radius)];
    for r in 1..rings {
        let theta = std::f64::consts::PI * r as f64 / rings as f64;
        for s in 0..segments {
            let phi = 2.0 * std::f64::consts::PI * s as f64 / segments as f64;
            vertices.push(radius * Vector3::new(theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos()));
        }
    }
    vertices.push(Vector3::new(0.0, 0.0, -radius));
    let south = vertices.len() as u32 - 1;
    let ring = |r: u32, s: u32| 1 + (r - 1) * segments + s % segments;

    let mut faces = Vec::new();
    for s in 0..segments {
        faces.push([0, ring(1, s), ring(1, s + 1)]);
        faces.push([south, ring(rings - 1, s + 1), ring(rings - 1, s)]);
    }
    for r in 1..rings - 1 {
        for s in 0..segments {
            let (a, b) = (ring(r, s), ring(r, s + 1));
            let (c, d) = (ring(r + 1, s), ring(r + 1, s + 1));
            faces.push([a, c, d]);
            faces.push([a, d, b]);
        }
    }
    Mesh::<RenderSpace>::new(vertices, faces)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn standardized_direction_is_orthonormal(
        roll in -3.1f64..3.1,
        pitch in -1.5f64..1.5,
        yaw in -3.1f64..3.1,
        ox in -100.0f64..100.0,
        oy in -100.0f64..100.0,
        oz in -100.0f64..100.0,
        spacing in 0.5f64..3.0,
    ) {
        let rotation = Rotation3::from_euler_angles(roll, pitch, yaw);
        let slices = rotated_stack(&rotation, Vector3::new(ox, oy, oz), spacing);
        let mut warnings = Vec::new();

        let mut stacks = StackClassifier::new(ClassifierOptions::default())
            .classify(slices, &mut warnings)
            .unwrap();
        prop_assert_eq!(stacks.len(), 1);
        let sequence = SliceSequencer::new(SequencerOptions::default())
            .sequence(stacks.remove(0), &mut warnings)
            .unwrap();

        let standardizer = VolumeStandardizer::new(StandardizerOptions {
            bias_correction: false,
            ..StandardizerOptions::default()
        });
        let assembled = standardizer.assemble(&sequence, &mut warnings).unwrap();
        prop_assert!(is_orthonormal(assembled.geometry().direction(), 1e-6));

        let volume = standardizer.standardize(&sequence, &mut warnings).unwrap();
        prop_assert!(is_orthonormal(volume.geometry().direction(), 1e-6));
        prop_assert!(volume.geometry().spacing().iter().all(|&s| s > 0.0));
    }

    #[test]
    fn finisher_keeps_indices_valid_and_respects_floor(
        radius in 0.01f64..2.0,
        rings in 3u32..20,
        segments in 3u32..24,
        reduction in 0.0f64..0.95,
        min_vertices in 4usize..200,
        junk in proptest::collection::vec((0u32..600, 0u32..600, 0u32..600), 0..8),
    ) {
        let sphere = uv_sphere(radius, rings, segments);
        let input_vertices = sphere.vertex_count();
        let (vertices, mut faces) = sphere.into_parts();
        // out-of-range and degenerate faces must be cleaned away
        faces.extend(junk.into_iter().map(|(a, b, c)| [a, b, c]));
        let mesh = Mesh::<RenderSpace>::new(vertices, faces);

        let finisher = MeshFinisher::new(FinishingOptions {
            target_reduction: reduction,
            min_vertices,
            ..FinishingOptions::default()
        });
        let finished = finisher.finish(mesh);

        let count = finished.vertex_count() as u32;
        prop_assert!(finished.faces().iter().all(|f| f.iter().all(|&i| i < count)));
        prop_assert!(finished.is_valid());
        prop_assert!(finished.vertex_count() >= min_vertices.min(input_vertices));
    }
}
