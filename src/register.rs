use crate::config::RegistrationOptions;
use crate::enums::Interpolation;
use crate::error::{GeometryError, ReconError};
use crate::job::{CancellationToken, Stage, Warning};
use crate::volume::Volume;

use nalgebra::{Matrix4, Rotation3, Vector3, Vector6};
use ndarray::Zip;
use rayon::prelude::*;
use tracing::{debug, info};

/// Fewer in-overlap samples than this give no usable metric.
const MIN_METRIC_SAMPLES: f64 = 16.0;

/// Maps fixed (reference) physical points into the moving volume:
/// `T(x) = R (x - c) + c + t`.
#[derive(Clone, Debug, PartialEq)]
pub struct RigidTransform {
    rotation: Rotation3<f64>,
    center: Vector3<f64>,
    translation: Vector3<f64>,
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            rotation: Rotation3::identity(),
            center: Vector3::zeros(),
            translation: Vector3::zeros(),
        }
    }

    /// Rotation by Euler angles (roll, pitch, yaw) about `center`, then translation.
    pub fn new(angles: Vector3<f64>, center: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: Rotation3::from_euler_angles(angles.x, angles.y, angles.z),
            center,
            translation,
        }
    }

    pub fn rotation(&self) -> &Rotation3<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    #[inline]
    pub fn apply(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * (point - self.center) + self.center + self.translation
    }

    /// Homogeneous 4x4 form.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let offset = self.center + self.translation - self.rotation * self.center;
        let mut matrix = self.rotation.to_homogeneous();
        matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(&offset);
        matrix
    }
}

#[derive(Clone, Debug)]
pub struct Registration {
    pub transform: RigidTransform,
    pub mutual_information: f64,
    /// Share of metric samples that landed inside the moving volume.
    pub overlap: f64,
}

/// The fused volume on the reference grid.
#[derive(Clone, Debug)]
pub struct Fusion {
    pub volume: Volume,
    /// Input volumes that contributed, the reference included.
    pub fused: usize,
}

/// Joint-histogram mutual information between a fixed point set and a
/// moving volume.
struct Metric<'a> {
    points: Vec<Vector3<f64>>,
    fixed_bins: Vec<f64>,
    moving: &'a Volume,
    moving_low: f32,
    moving_scale: f64,
    bins: usize,
}

impl<'a> Metric<'a> {
    fn new(fixed: &Volume, moving: &'a Volume, stride: usize, max_samples: usize, bins: usize) -> Self {
        let (depth, height, width) = fixed.dim();
        let total = (depth * height * width) as f64;
        let cap = (total / max_samples.max(1) as f64).cbrt().ceil() as usize;
        let stride = stride.max(cap).max(1);

        let (fixed_low, fixed_high) = fixed.value_range();
        let fixed_scale = bin_scale(fixed_low, fixed_high, bins);
        let (moving_low, moving_high) = moving.value_range();

        let geometry = fixed.geometry();
        let data = fixed.data();
        let mut points = Vec::new();
        let mut fixed_bins = Vec::new();
        for z in (0..depth).step_by(stride) {
            for y in (0..height).step_by(stride) {
                for x in (0..width).step_by(stride) {
                    points.push(geometry.index_to_physical(&Vector3::new(x as f64, y as f64, z as f64)));
                    fixed_bins.push((data[[z, y, x]] - fixed_low) as f64 * fixed_scale);
                }
            }
        }

        Self {
            points,
            fixed_bins,
            moving,
            moving_low,
            moving_scale: bin_scale(moving_low, moving_high, bins),
            bins,
        }
    }

    /// `(mutual information, overlap)`
    fn evaluate(&self, transform: &RigidTransform) -> (f64, f64) {
        let bins = self.bins;
        let mut joint = vec![0.0_f64; bins * bins];
        let mut inside = 0.0_f64;

        for (point, &fixed_bin) in self.points.iter().zip(&self.fixed_bins) {
            let Some(value) = self
                .moving
                .sample(&transform.apply(point), Interpolation::Linear)
            else {
                continue;
            };
            inside += 1.0;
            let moving_bin = (value - self.moving_low) as f64 * self.moving_scale;
            // linear Parzen window in both dimensions
            let (f0, fw) = split_bin(fixed_bin, bins);
            let (m0, mw) = split_bin(moving_bin, bins);
            let f1 = (f0 + 1).min(bins - 1);
            let m1 = (m0 + 1).min(bins - 1);
            joint[f0 * bins + m0] += (1.0 - fw) * (1.0 - mw);
            joint[f0 * bins + m1] += (1.0 - fw) * mw;
            joint[f1 * bins + m0] += fw * (1.0 - mw);
            joint[f1 * bins + m1] += fw * mw;
        }

        let overlap = inside / self.points.len().max(1) as f64;
        if inside < MIN_METRIC_SAMPLES {
            return (0.0, overlap);
        }
        (mutual_information(&joint, bins, inside), overlap)
    }
}

fn bin_scale(low: f32, high: f32, bins: usize) -> f64 {
    let range = (high - low) as f64;
    if range > 0.0 {
        (bins - 1) as f64 / range
    } else {
        0.0
    }
}

fn split_bin(position: f64, bins: usize) -> (usize, f64) {
    let clamped = position.clamp(0.0, (bins - 1) as f64);
    let lower = clamped.floor() as usize;
    (lower.min(bins - 1), clamped - lower as f64)
}

fn mutual_information(joint: &[f64], bins: usize, total: f64) -> f64 {
    let mut fixed_marginal = vec![0.0_f64; bins];
    let mut moving_marginal = vec![0.0_f64; bins];
    for f in 0..bins {
        for m in 0..bins {
            let p = joint[f * bins + m] / total;
            fixed_marginal[f] += p;
            moving_marginal[m] += p;
        }
    }
    let mut mi = 0.0;
    for f in 0..bins {
        for m in 0..bins {
            let p = joint[f * bins + m] / total;
            if p > 0.0 {
                mi += p * (p / (fixed_marginal[f] * moving_marginal[m])).ln();
            }
        }
    }
    mi.max(0.0)
}

pub struct MultiPlaneRegistrator {
    options: RegistrationOptions,
}

impl MultiPlaneRegistrator {
    pub fn new(options: RegistrationOptions) -> Self {
        Self { options }
    }

    /// Align every volume to the largest one and max-fuse the ones that
    /// registered. A single volume passes through unchanged.
    pub fn register_and_fuse(
        &self,
        mut volumes: Vec<Volume>,
        warnings: &mut Vec<Warning>,
        cancel: &CancellationToken,
    ) -> Result<Fusion, ReconError> {
        if volumes.len() <= 1 {
            let volume = volumes.pop().ok_or(ReconError::NoUsableGeometry)?;
            return Ok(Fusion { volume, fused: 1 });
        }

        let reference_index = volumes
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.extent()
                    .product()
                    .total_cmp(&b.extent().product())
                    .then(std::cmp::Ordering::Greater)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        let reference = volumes.remove(reference_index);
        debug!(reference_index, moving = volumes.len(), "Selected reference volume");

        let results: Vec<Result<Registration, ReconError>> = volumes
            .par_iter()
            .map(|moving| self.register(&reference, moving, cancel))
            .collect();

        let mut aligned = Vec::new();
        for (i, (moving, result)) in volumes.iter().zip(results).enumerate() {
            match result {
                Ok(registration) => {
                    info!(
                        volume = i,
                        mutual_information = registration.mutual_information,
                        overlap = registration.overlap,
                        "Registered volume"
                    );
                    aligned.push((moving, registration.transform));
                }
                Err(ReconError::Cancelled) => return Err(ReconError::Cancelled),
                Err(e) => Warning::record(
                    warnings,
                    Stage::Register,
                    format!("Volume {i} excluded from fusion: {e}"),
                ),
            }
        }

        let fused = aligned.len() + 1;
        let volume = fuse_max(&reference, &aligned)?;
        info!(fused, "Fused volumes");
        Ok(Fusion { volume, fused })
    }

    /// Rigid, mutual-information driven alignment of `moving` onto `fixed`.
    ///
    /// # Errors
    ///
    /// `RegistrationFailure` when the finest level runs out of iterations
    /// before the step shrinks below `min_step`, or when the final similarity
    /// or overlap is below the acceptance thresholds. `Cancelled` when the
    /// token fires.
    pub fn register(
        &self,
        fixed: &Volume,
        moving: &Volume,
        cancel: &CancellationToken,
    ) -> Result<Registration, ReconError> {
        let options = &self.options;
        let center = fixed.center();
        let initial_translation = moving.center() - center;
        // rotation parameters are scaled to arc length at this radius
        let radius = (0.5 * fixed.extent().norm()).max(1.0);

        let transform_at = |u: &Vector6<f64>| {
            RigidTransform::new(
                Vector3::new(u[0], u[1], u[2]) / radius,
                center,
                initial_translation + Vector3::new(u[3], u[4], u[5]),
            )
        };

        let first_shrink = options.shrink_factors.first().copied().unwrap_or(1) as f64;
        let mut u = Vector6::zeros();
        let mut converged = false;
        let mut iterations = 0;
        for &shrink in &options.shrink_factors {
            let metric = Metric::new(fixed, moving, shrink, options.max_samples, options.histogram_bins);
            let h = 0.5 * shrink as f64;
            let mut step = options.max_step * shrink as f64 / first_shrink;
            let mut previous: Option<Vector6<f64>> = None;
            let mut flat = false;
            iterations = 0;

            while iterations < options.max_iterations && step >= options.min_step {
                cancel.check()?;
                iterations += 1;

                let gradient = Vector6::from_fn(|k, _| {
                    let mut forward = u;
                    let mut backward = u;
                    forward[k] += h;
                    backward[k] -= h;
                    (metric.evaluate(&transform_at(&forward)).0
                        - metric.evaluate(&transform_at(&backward)).0)
                        / (2.0 * h)
                });
                let norm = gradient.norm();
                if !(norm > 1e-12) {
                    flat = true;
                    break;
                }
                if previous.is_some_and(|p| p.dot(&gradient) < 0.0) {
                    step *= 0.5;
                }
                u += gradient * (step / norm);
                previous = Some(gradient);
            }
            // only the finest level decides
            converged = flat || step < options.min_step;
            debug!(shrink, iterations, step, converged, "Registration level done");
        }

        if !converged {
            return Err(ReconError::RegistrationFailure {
                reason: format!("did not converge after {iterations} iterations"),
            });
        }

        let transform = transform_at(&u);
        let finest = options.shrink_factors.last().copied().unwrap_or(1);
        let (mutual_information, overlap) =
            Metric::new(fixed, moving, finest, options.max_samples, options.histogram_bins)
                .evaluate(&transform);

        if !mutual_information.is_finite() || mutual_information < options.min_mutual_information {
            return Err(ReconError::RegistrationFailure {
                reason: format!(
                    "mutual information {mutual_information:.4} below {}",
                    options.min_mutual_information
                ),
            });
        }
        if overlap < options.min_overlap {
            return Err(ReconError::RegistrationFailure {
                reason: format!("overlap {overlap:.3} below {}", options.min_overlap),
            });
        }

        Ok(Registration {
            transform,
            mutual_information,
            overlap,
        })
    }
}

/// Voxel-wise maximum of the reference and every aligned volume, sampled on
/// the reference grid. Positions a moving volume does not cover keep the
/// reference value.
pub fn fuse_max(
    reference: &Volume,
    aligned: &[(&Volume, RigidTransform)],
) -> Result<Volume, GeometryError> {
    let geometry = reference.geometry().clone();
    let mut data = reference.data().clone();
    Zip::indexed(&mut data).par_for_each(|(z, y, x), value| {
        let point = geometry.index_to_physical(&Vector3::new(x as f64, y as f64, z as f64));
        for (moving, transform) in aligned {
            if let Some(sample) = moving.sample(&transform.apply(&point), Interpolation::Linear) {
                if sample > *value {
                    *value = sample;
                }
            }
        }
    });
    Volume::new(data, geometry)
}
