//! Synthetic slice phantoms: a bright body cylinder along z with a dark bone
//! rod inside, sampled as axial or sagittal slice stacks.

#![allow(dead_code)]

use dicom_mesh::config::ReconOptions;
use dicom_mesh::{Slice, Tissue};
use nalgebra::Vector3;
use ndarray::Array2;

pub const IN_PLANE: f64 = 0.332;
pub const AXIAL_SPACING: f64 = 0.737;
pub const PIXELS: usize = 160;
pub const BODY_RADIUS: f64 = 20.0;
pub const BONE_RADIUS: f64 = 4.0;
pub const BONE_HALF_LENGTH: f64 = 35.0;

/// Intensity at a patient-space point, in mm.
pub fn phantom(p: &Vector3<f64>) -> f32 {
    let r = (p.x * p.x + p.y * p.y).sqrt();
    if r < BONE_RADIUS && p.z.abs() < BONE_HALF_LENGTH {
        20.0
    } else if r < BODY_RADIUS {
        100.0
    } else {
        0.0
    }
}

/// The body cylinder alone, without the rod.
pub fn body_only(p: &Vector3<f64>) -> f32 {
    if (p.x * p.x + p.y * p.y).sqrt() < BODY_RADIUS {
        100.0
    } else {
        0.0
    }
}

/// One slice whose top-left pixel sits at `position`; pixel `[r, c]` lies at
/// `position + c * IN_PLANE * row + r * IN_PLANE * column`.
fn render(position: Vector3<f64>, row: Vector3<f64>, column: Vector3<f64>, gain: f32) -> Slice {
    render_with(phantom, position, row, column, gain)
}

fn render_with(
    intensity: fn(&Vector3<f64>) -> f32,
    position: Vector3<f64>,
    row: Vector3<f64>,
    column: Vector3<f64>,
    gain: f32,
) -> Slice {
    let pixels = Array2::from_shape_fn((PIXELS, PIXELS), |(r, c)| {
        let p = position + row * (c as f64 * IN_PLANE) + column * (r as f64 * IN_PLANE);
        intensity(&p) * gain
    });
    Slice::new(pixels)
        .with_pixel_spacing(IN_PLANE, IN_PLANE)
        .with_position(position)
        .with_orientation(row, column)
        .with_frame_of_reference("1.2.826.0.1.3680043.2.1125.1")
}

fn half_field() -> f64 {
    (PIXELS as f64 - 1.0) / 2.0 * IN_PLANE
}

/// `count` axial slices centred on the origin.
pub fn axial_stack(count: usize) -> Vec<Slice> {
    axial_stack_of(phantom, count)
}

/// `count` axial slices of `intensity` centred on the origin.
pub fn axial_stack_of(intensity: fn(&Vector3<f64>) -> f32, count: usize) -> Vec<Slice> {
    let half = half_field();
    let z0 = -(count as f64 - 1.0) / 2.0 * AXIAL_SPACING;
    (0..count)
        .map(|k| {
            let position = Vector3::new(-half, -half, z0 + k as f64 * AXIAL_SPACING);
            render_with(intensity, position, Vector3::x(), Vector3::y(), 1.0)
                .with_series_uid("axial")
                .with_acquisition_index(k as i32 + 1)
        })
        .collect()
}

/// `count` sagittal slices through the centre of the body at `spacing`,
/// acquired with half the gain of the axial series.
pub fn sagittal_stack(count: usize, spacing: f64) -> Vec<Slice> {
    let half = half_field();
    let x0 = -(count as f64 - 1.0) / 2.0 * spacing;
    (0..count)
        .map(|k| {
            let position = Vector3::new(x0 + k as f64 * spacing, -half, half);
            render(position, Vector3::y(), -Vector3::z(), 0.5)
                .with_series_uid("sagittal")
                .with_acquisition_index(k as i32 + 1)
        })
        .collect()
}

/// Strip the position from slice `index`, keeping everything else.
pub fn without_position(slices: Vec<Slice>, index: usize) -> Vec<Slice> {
    slices
        .into_iter()
        .enumerate()
        .map(|(i, slice)| {
            if i != index {
                return slice;
            }
            let (row_spacing, column_spacing) = slice.pixel_spacing().unwrap();
            let (row, column) = *slice.orientation().unwrap();
            let mut stripped = Slice::new(slice.pixels().clone())
                .with_pixel_spacing(row_spacing, column_spacing)
                .with_orientation(row, column)
                .with_series_uid(slice.series_uid().unwrap())
                .with_acquisition_index(slice.acquisition_index().unwrap());
            if let Some(frame) = slice.frame_of_reference_uid() {
                stripped = stripped.with_frame_of_reference(frame);
            }
            stripped
        })
        .collect()
}

/// Defaults with a lighter registration schedule for test runtime.
pub fn test_options() -> ReconOptions {
    let mut options = ReconOptions::default();
    options.segmentation.tissues = vec![Tissue::Bone];
    options.registration.shrink_factors = vec![2, 1];
    options.registration.max_samples = 5000;
    options.registration.max_iterations = 40;
    options
}
