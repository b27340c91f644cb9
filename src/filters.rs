//! Scalar filters shared by the standardizer, segmenter and surface extractor.

use nalgebra::Vector3;
use ndarray::{Array3, Axis, Zip};

const HISTOGRAM_BINS: usize = 256;

/// Normalized 1D Gaussian kernel with radius `ceil(3 * sigma)`.
pub fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(0.0) as usize;
    let size = 2 * radius + 1;
    let two_sigma_sq = 2.0 * sigma * sigma;

    let mut kernel: Vec<f32> = (0..size)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-x * x / two_sigma_sq).exp() as f32
        })
        .collect();

    let sum: f32 = kernel.iter().sum();
    for value in &mut kernel {
        *value /= sum;
    }
    kernel
}

/// Separable Gaussian blur with per-axis sigma in voxels, given as `(x, y, z)`.
///
/// Truncated kernels at the border are renormalized, so a constant field
/// stays constant.
pub fn gaussian_smooth(data: &Array3<f32>, sigma: &Vector3<f64>) -> Array3<f32> {
    let mut out = data.clone();
    // grid axis x is array axis 2
    for (grid_axis, array_axis) in [(0usize, 2usize), (1, 1), (2, 0)] {
        let s = sigma[grid_axis];
        if s <= 0.0 || !s.is_finite() || out.len_of(Axis(array_axis)) < 2 {
            continue;
        }
        let kernel = gaussian_kernel(s);
        Zip::from(out.lanes_mut(Axis(array_axis))).par_for_each(|mut lane| {
            let source = lane.to_vec();
            let n = source.len() as isize;
            let half = (kernel.len() / 2) as isize;
            for (i, value) in lane.iter_mut().enumerate() {
                let mut sum = 0.0_f32;
                let mut weight = 0.0_f32;
                for (k, &kval) in kernel.iter().enumerate() {
                    let j = i as isize + k as isize - half;
                    if j >= 0 && j < n {
                        sum += source[j as usize] * kval;
                        weight += kval;
                    }
                }
                *value = sum / weight;
            }
        });
    }
    out
}

/// Gaussian blur of `values` where each voxel counts with `weights`.
///
/// Voxels whose smoothed weight vanishes take `fallback`.
pub fn normalized_convolution(
    values: &Array3<f32>,
    weights: &Array3<f32>,
    sigma: &Vector3<f64>,
    fallback: f32,
) -> Array3<f32> {
    let weighted = values * weights;
    let numerator = gaussian_smooth(&weighted, sigma);
    let denominator = gaussian_smooth(weights, sigma);
    let mut out = numerator;
    Zip::from(&mut out)
        .and(&denominator)
        .par_for_each(|value, &weight| {
            *value = if weight > 1e-6 { *value / weight } else { fallback };
        });
    out
}

/// Linear-interpolated percentile, `p` in `[0, 100]`. `None` for no values.
pub fn percentile(values: impl IntoIterator<Item = f32>, p: f64) -> Option<f32> {
    let mut sorted: Vec<f32> = values.into_iter().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_unstable_by(f32::total_cmp);
    Some(percentile_of_sorted(&sorted, p))
}

/// Percentile of an already ascending, non-empty slice.
pub fn percentile_of_sorted(sorted: &[f32], p: f64) -> f32 {
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let t = (rank - lower as f64) as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * t
}

/// Median of a list of finite values.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_unstable_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Otsu threshold over a 256-bin histogram of `values`.
pub fn otsu_threshold(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }

    let min_val = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max_val = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max_val - min_val;
    if !(range > 0.0) {
        return min_val;
    }

    let mut histogram = [0u64; HISTOGRAM_BINS];
    let scale = (HISTOGRAM_BINS - 1) as f32 / range;
    for &value in values {
        let bin = (((value - min_val) * scale) as usize).min(HISTOGRAM_BINS - 1);
        histogram[bin] += 1;
    }

    let total = values.len() as f64;
    let total_sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum();

    let mut best_first = 0;
    let mut best_last = 0;
    let mut best_variance = 0.0_f64;
    let mut background_count = 0.0_f64;
    let mut background_sum = 0.0_f64;

    for (t, &count) in histogram.iter().enumerate() {
        background_count += count as f64;
        if background_count == 0.0 {
            continue;
        }
        let foreground_count = total - background_count;
        if foreground_count == 0.0 {
            break;
        }
        background_sum += t as f64 * count as f64;
        let mean_bg = background_sum / background_count;
        let mean_fg = (total_sum - background_sum) / foreground_count;
        let diff = mean_bg - mean_fg;
        let variance = background_count * foreground_count * diff * diff;

        if variance > best_variance {
            best_variance = variance;
            best_first = t;
            best_last = t;
        } else if variance == best_variance {
            best_last = t;
        }
    }

    // plateau of equal variance: take its middle, upper bin edge
    let best = (best_first + best_last) as f32 / 2.0 + 1.0;
    min_val + best / scale
}

/// Gradient magnitude with central differences, in intensity per mm.
pub fn gradient_magnitude(data: &Array3<f32>, spacing: &Vector3<f64>) -> Array3<f32> {
    let (depth, height, width) = data.dim();
    let (sx, sy, sz) = (spacing.x as f32, spacing.y as f32, spacing.z as f32);
    let mut out = Array3::<f32>::zeros(data.dim());

    Zip::indexed(&mut out).par_for_each(|(z, y, x), value| {
        let diff = |lo: f32, hi: f32, steps: usize, step: f32| {
            if steps == 0 {
                0.0
            } else {
                (hi - lo) / (steps as f32 * step)
            }
        };
        let (x0, x1) = (x.saturating_sub(1), (x + 1).min(width - 1));
        let (y0, y1) = (y.saturating_sub(1), (y + 1).min(height - 1));
        let (z0, z1) = (z.saturating_sub(1), (z + 1).min(depth - 1));
        let gx = diff(data[[z, y, x0]], data[[z, y, x1]], x1 - x0, sx);
        let gy = diff(data[[z, y0, x]], data[[z, y1, x]], y1 - y0, sy);
        let gz = diff(data[[z0, y, x]], data[[z1, y, x]], z1 - z0, sz);
        *value = (gx * gx + gy * gy + gz * gz).sqrt();
    });
    out
}

/// Mean over non-overlapping blocks of `factor` voxels per axis, `(x, y, z)`.
pub fn block_average(data: &Array3<f32>, factor: &Vector3<usize>) -> Array3<f32> {
    let (depth, height, width) = data.dim();
    let (fx, fy, fz) = (factor.x.max(1), factor.y.max(1), factor.z.max(1));
    let shape = (depth.div_ceil(fz), height.div_ceil(fy), width.div_ceil(fx));

    Array3::from_shape_fn(shape, |(bz, by, bx)| {
        let mut sum = 0.0_f64;
        let mut count = 0usize;
        for z in bz * fz..((bz + 1) * fz).min(depth) {
            for y in by * fy..((by + 1) * fy).min(height) {
                for x in bx * fx..((bx + 1) * fx).min(width) {
                    sum += data[[z, y, x]] as f64;
                    count += 1;
                }
            }
        }
        (sum / count.max(1) as f64) as f32
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_sums_to_one_and_is_symmetric() {
        let kernel = gaussian_kernel(1.5);
        let sum: f32 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        let n = kernel.len();
        for i in 0..n / 2 {
            assert!((kernel[i] - kernel[n - 1 - i]).abs() < 1e-7);
        }
    }

    #[test]
    fn smoothing_preserves_uniform_volume() {
        let data = Array3::from_elem((5, 6, 7), 3.5_f32);
        let smoothed = gaussian_smooth(&data, &Vector3::new(1.0, 2.0, 0.5));
        assert!(smoothed.iter().all(|v| (v - 3.5).abs() < 1e-5));
    }

    #[test]
    fn smoothing_spreads_a_spike() {
        let mut data = Array3::<f32>::zeros((9, 9, 9));
        data[[4, 4, 4]] = 1.0;
        let smoothed = gaussian_smooth(&data, &Vector3::repeat(1.0));
        assert!(smoothed[[4, 4, 4]] < 1.0);
        assert!(smoothed[[4, 4, 5]] > 0.0);
        assert!((smoothed.sum() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn otsu_splits_bimodal_values() {
        let mut values = vec![10.0_f32; 500];
        values.extend(std::iter::repeat_n(200.0_f32, 500));
        let threshold = otsu_threshold(&values);
        assert!(threshold > 10.0 && threshold < 200.0);
    }

    #[test]
    fn otsu_of_constant_is_that_value() {
        assert_eq!(otsu_threshold(&[42.0; 8]), 42.0);
        assert_eq!(otsu_threshold(&[]), 0.0);
    }

    #[test]
    fn percentile_interpolates() {
        let values = (0..=100).map(|v| v as f32);
        assert_eq!(percentile(values.clone(), 50.0), Some(50.0));
        assert_eq!(percentile(values, 95.0), Some(95.0));
        assert_eq!(percentile(Vec::<f32>::new(), 50.0), None);
    }

    #[test]
    fn median_of_even_count_averages() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn gradient_of_ramp_is_slope_over_spacing() {
        let data = Array3::from_shape_fn((4, 4, 4), |(_, _, x)| x as f32 * 2.0);
        let gradient = gradient_magnitude(&data, &Vector3::new(0.5, 1.0, 1.0));
        assert!((gradient[[1, 1, 1]] - 4.0).abs() < 1e-5);
        assert!((gradient[[1, 1, 0]] - 4.0).abs() < 1e-5);
    }

    #[test]
    fn block_average_handles_partial_blocks() {
        let data = Array3::from_shape_fn((1, 1, 5), |(_, _, x)| x as f32);
        let coarse = block_average(&data, &Vector3::new(2, 1, 1));
        assert_eq!(coarse.dim(), (1, 1, 3));
        assert_eq!(coarse[[0, 0, 0]], 0.5);
        assert_eq!(coarse[[0, 0, 2]], 4.0);
    }
}
