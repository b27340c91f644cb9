use crate::enums::Interpolation;

use nalgebra::Vector3;
use ndarray::ArrayView3;

/// Continuous indices this far outside the grid are snapped onto its border.
const EDGE_TOLERANCE: f64 = 1e-3;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Grid size `(x, y, z)` after resampling from `spacing` to `target`,
    /// keeping every new sample inside the span of the old samples.
    pub(crate) fn resampled_dimensions(
        spacing: &Vector3<f64>,
        size: &Vector3<usize>,
        target: &Vector3<f64>,
    ) -> Vector3<usize> {
        Vector3::from_fn(|i, _| {
            let span = size[i].saturating_sub(1) as f64 * spacing[i];
            (span / target[i] + 1e-6).floor() as usize + 1
        })
    }

    /// Value at continuous grid index `(x, y, z)`; `None` outside the grid.
    #[inline]
    pub(crate) fn sample(
        data: &ArrayView3<f32>,
        index: &Vector3<f64>,
        interpolation: Interpolation,
    ) -> Option<f32> {
        match interpolation {
            Interpolation::Nearest => Self::nearest(data, index),
            Interpolation::Linear => Self::trilinear_interpolate(data, index),
        }
    }

    #[inline]
    pub(crate) fn nearest(data: &ArrayView3<f32>, index: &Vector3<f64>) -> Option<f32> {
        let (depth, height, width) = data.dim();
        let x = Self::snap(index.x.round(), width)?;
        let y = Self::snap(index.y.round(), height)?;
        let z = Self::snap(index.z.round(), depth)?;
        Some(data[[z as usize, y as usize, x as usize]])
    }

    #[inline]
    pub(crate) fn trilinear_interpolate(
        data: &ArrayView3<f32>,
        index: &Vector3<f64>,
    ) -> Option<f32> {
        let (depth, height, width) = data.dim();
        let x = Self::snap(index.x, width)?;
        let y = Self::snap(index.y, height)?;
        let z = Self::snap(index.z, depth)?;

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let z0 = z.floor() as usize;
        let x1 = (x0 + 1).min(width - 1);
        let y1 = (y0 + 1).min(height - 1);
        let z1 = (z0 + 1).min(depth - 1);

        let dx = (x - x0 as f64) as f32;
        let dy = (y - y0 as f64) as f32;
        let dz = (z - z0 as f64) as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;
        let one_minus_dz = 1.0 - dz;

        let plane = |zi: usize| {
            let v00 = data[[zi, y0, x0]];
            let v01 = data[[zi, y0, x1]];
            let v10 = data[[zi, y1, x0]];
            let v11 = data[[zi, y1, x1]];
            let v0 = v00.mul_add(one_minus_dx, v01 * dx);
            let v1 = v10.mul_add(one_minus_dx, v11 * dx);
            v0.mul_add(one_minus_dy, v1 * dy)
        };

        Some(plane(z0).mul_add(one_minus_dz, plane(z1) * dz))
    }

    /// Clamp a coordinate within tolerance of `[0, n - 1]`, reject the rest.
    #[inline]
    fn snap(value: f64, n: usize) -> Option<f64> {
        let upper = n as f64 - 1.0;
        if !value.is_finite() || value < -EDGE_TOLERANCE || value > upper + EDGE_TOLERANCE {
            return None;
        }
        Some(value.clamp(0.0, upper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ramp() -> Array3<f32> {
        Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (x + 10 * y + 100 * z) as f32)
    }

    #[test]
    fn trilinear_reproduces_linear_field() {
        let data = ramp();
        let value =
            Interpolator::trilinear_interpolate(&data.view(), &Vector3::new(1.5, 2.25, 0.5))
                .unwrap();
        assert!((value - (1.5 + 22.5 + 50.0)).abs() < 1e-4);
    }

    #[test]
    fn samples_outside_grid_are_none() {
        let data = ramp();
        assert!(Interpolator::trilinear_interpolate(&data.view(), &Vector3::new(4.5, 0.0, 0.0)).is_none());
        assert!(Interpolator::nearest(&data.view(), &Vector3::new(0.0, -0.6, 0.0)).is_none());
    }

    #[test]
    fn edge_samples_are_clamped() {
        let data = ramp();
        let value =
            Interpolator::trilinear_interpolate(&data.view(), &Vector3::new(4.0005, 3.0, 2.0))
                .unwrap();
        assert_eq!(value, 234.0);
    }

    #[test]
    fn resampled_dimensions_keep_extent() {
        let dims = Interpolator::resampled_dimensions(
            &Vector3::new(0.5, 0.5, 3.0),
            &Vector3::new(100, 80, 20),
            &Vector3::repeat(1.0),
        );
        assert_eq!(dims, Vector3::new(50, 40, 58));
    }
}
