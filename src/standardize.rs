use crate::config::StandardizerOptions;
use crate::enums::Interpolation;
use crate::error::{GeometryError, ReconError};
use crate::filters::{block_average, gaussian_smooth, normalized_convolution, otsu_threshold};
use crate::interpolator::Interpolator;
use crate::job::{Stage, Warning};
use crate::sequencer::SliceSequence;
use crate::volume::{Geometry, Volume};

use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, Axis, Zip, s};
use tracing::{debug, info};

/// Direction matrices this close to the identity are snapped onto it.
const SNAP_TOLERANCE: f64 = 1e-4;

/// `PERMUTATIONS[k][i]` is the source grid axis that becomes grid axis `i`.
const PERMUTATIONS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

pub struct VolumeStandardizer {
    options: StandardizerOptions,
}

impl VolumeStandardizer {
    pub fn new(options: StandardizerOptions) -> Self {
        Self { options }
    }

    /// Assemble, bias-correct, reorient and resample one slice sequence.
    pub fn standardize(
        &self,
        sequence: &SliceSequence,
        warnings: &mut Vec<Warning>,
    ) -> Result<Volume, ReconError> {
        let volume = self.assemble(sequence, warnings)?;
        let volume = if self.options.bias_correction {
            self.correct_bias(volume)?
        } else {
            volume
        };
        let (volume, slice_axis) = reorient(volume)?;
        let volume = self.resample(volume, slice_axis, warnings)?;

        let (depth, height, width) = volume.dim();
        info!(
            width,
            height,
            depth,
            spacing = ?volume.geometry().spacing().as_slice(),
            "Standardized volume"
        );
        Ok(volume)
    }

    /// Stack the slices into a grid whose axes are the row direction, the
    /// column direction and the stack normal.
    pub fn assemble(
        &self,
        sequence: &SliceSequence,
        warnings: &mut Vec<Warning>,
    ) -> Result<Volume, GeometryError> {
        let slices = sequence.slices();
        let first = slices.first().ok_or(GeometryError::TooFewSlices {
            found: 0,
            required: 1,
        })?;
        let (rows, columns) = first.dim();
        if slices.iter().any(|slice| slice.dim() != (rows, columns)) {
            return Err(GeometryError::InconsistentDimensions);
        }

        let (row_spacing, column_spacing) = match slices.iter().find_map(|s| s.pixel_spacing())
        {
            Some(spacing) => spacing,
            None => {
                let fallback = self.options.fallback_pixel_spacing;
                Warning::record(
                    warnings,
                    Stage::Standardize,
                    format!("No pixel spacing found; assuming {fallback} mm"),
                );
                (fallback, fallback)
            }
        };

        let (row_dir, column_dir) = slices
            .iter()
            .find_map(|s| s.orientation().copied())
            .unwrap_or((Vector3::x(), Vector3::y()));

        // Gram-Schmidt on the in-plane axes
        let x_axis = row_dir
            .try_normalize(f64::EPSILON)
            .ok_or(GeometryError::DegenerateOrientation)?;
        let y_axis = (column_dir - x_axis * column_dir.dot(&x_axis))
            .try_normalize(1e-6)
            .ok_or(GeometryError::DegenerateOrientation)?;
        let mut z_axis = x_axis.cross(&y_axis);
        if sequence.normal().is_some_and(|n| n.dot(&z_axis) < 0.0) {
            z_axis = -z_axis;
        }
        let direction = Matrix3::from_columns(&[x_axis, y_axis, z_axis]);
        let spacing = Vector3::new(column_spacing, row_spacing, sequence.slice_spacing());

        let origin = slices
            .iter()
            .enumerate()
            .find_map(|(i, slice)| {
                slice
                    .position()
                    .map(|p| p - z_axis * (i as f64 * spacing.z))
            })
            .unwrap_or_else(|| z_axis * sequence.keys()[0]);

        let mut data = Array3::<f32>::zeros((slices.len(), rows, columns));
        for (i, slice) in slices.iter().enumerate() {
            data.slice_mut(s![i, .., ..]).assign(slice.pixels());
        }

        Volume::new(data, Geometry::new(spacing, origin, direction)?)
    }

    /// Divide out a smooth multiplicative field estimated from the log
    /// intensities of the Otsu foreground.
    pub fn correct_bias(&self, volume: Volume) -> Result<Volume, GeometryError> {
        let values: Vec<f32> = volume.data().iter().copied().collect();
        let threshold = otsu_threshold(&values);
        let weights = volume
            .data()
            .mapv(|v| if v > threshold && v > 0.0 { 1.0_f32 } else { 0.0 });
        if weights.sum() < 1.0 {
            return Ok(volume);
        }

        let (mut data, geometry) = volume.into_parts();
        let spacing = *geometry.spacing();
        let factor = spacing.map(|s| ((self.options.bias_grid_spacing / s).round() as usize).max(1));

        let log_weighted = Zip::from(&data)
            .and(&weights)
            .par_map_collect(|&v, &w| v.max(1e-3).ln() * w);
        let coarse_sum = block_average(&log_weighted, &factor);
        let coarse_weight = block_average(&weights, &factor);
        let coarse_log = Zip::from(&coarse_sum)
            .and(&coarse_weight)
            .map_collect(|&sum, &w| if w > 0.0 { sum / w } else { 0.0 });

        let coarse_spacing = Vector3::from_fn(|i, _| spacing[i] * factor[i] as f64);
        let sigma = coarse_spacing.map(|s| self.options.bias_sigma / s);
        let mut field = normalized_convolution(&coarse_log, &coarse_weight, &sigma, 0.0);

        let total_weight: f32 = coarse_weight.sum();
        let mean = Zip::from(&field)
            .and(&coarse_weight)
            .fold(0.0_f32, |acc, &f, &w| acc + f * w)
            / total_weight;
        field.mapv_inplace(|f| f - mean);

        let (cd, ch, cw) = field.dim();
        let coarse_dims = Vector3::new(cw, ch, cd);
        let field_view = field.view();
        Zip::indexed(&mut data).par_for_each(|(z, y, x), value| {
            let fine = Vector3::new(x, y, z);
            let index = Vector3::from_fn(|i, _| {
                let c = (fine[i] as f64 + 0.5) / factor[i] as f64 - 0.5;
                c.clamp(0.0, (coarse_dims[i] - 1) as f64)
            });
            if let Some(log_bias) = Interpolator::trilinear_interpolate(&field_view, &index) {
                *value /= log_bias.exp();
            }
        });

        debug!(
            factor = ?factor.as_slice(),
            coarse = ?coarse_dims.as_slice(),
            "Estimated bias field"
        );
        Volume::new(data, geometry)
    }

    /// Resample to the adaptive target spacing. Thick-slice volumes keep their
    /// resolution and are only smoothed in-plane; oblique volumes always end
    /// on an identity-direction grid.
    pub fn resample(
        &self,
        volume: Volume,
        slice_axis: usize,
        warnings: &mut Vec<Warning>,
    ) -> Result<Volume, GeometryError> {
        let spacing = *volume.geometry().spacing();
        let in_plane = (0..3)
            .filter(|&i| i != slice_axis)
            .map(|i| spacing[i])
            .fold(f64::INFINITY, f64::min);
        let ratio = spacing[slice_axis] / in_plane;

        if ratio > self.options.anisotropy_warning_ratio {
            Warning::record(
                warnings,
                Stage::Standardize,
                format!("High anisotropy: slice spacing is {ratio:.1}x the in-plane spacing"),
            );
        }

        let oblique = *volume.geometry().direction() != Matrix3::identity();
        let thick = ratio > self.options.thick_slice_ratio;
        debug!(ratio, thick, oblique, "Resampling policy");

        if thick {
            let mut sigma = Vector3::repeat(self.options.thick_slice_sigma);
            sigma[slice_axis] = 0.0;
            let (data, geometry) = volume.into_parts();
            let smoothed = Volume::new(gaussian_smooth(&data, &sigma), geometry)?;
            if !oblique {
                return Ok(smoothed);
            }
            return resample_to_identity(&smoothed, &spacing);
        }

        let target = Vector3::repeat(self.isotropic_spacing(in_plane, ratio));
        resample_to_identity(&volume, &target)
    }

    /// Target spacing of the isotropic band.
    pub fn isotropic_spacing(&self, in_plane: f64, ratio: f64) -> f64 {
        let (low, high) = if ratio <= self.options.near_isotropic_ratio {
            self.options.fine_band
        } else {
            self.options.coarse_band
        };
        in_plane.clamp(low, high)
    }
}

/// Permute and flip grid axes so the direction matrix is as close to the
/// identity as the data allows. Returns the new grid axis of the slices.
pub fn reorient(volume: Volume) -> Result<(Volume, usize), GeometryError> {
    let (data, geometry) = volume.into_parts();
    let direction = *geometry.direction();

    let perm = PERMUTATIONS
        .iter()
        .copied()
        .max_by(|a, b| {
            let score = |p: &[usize; 3]| (0..3).map(|i| direction[(i, p[i])].abs()).sum::<f64>();
            score(a).total_cmp(&score(b)).then(std::cmp::Ordering::Greater)
        })
        .unwrap_or([0, 1, 2]);

    let mut data = data.permuted_axes([2 - perm[2], 2 - perm[1], 2 - perm[0]]);
    let mut spacing = Vector3::from_fn(|i, _| geometry.spacing()[perm[i]]);
    let mut columns: [Vector3<f64>; 3] = std::array::from_fn(|i| direction.column(perm[i]).into_owned());
    let mut origin = *geometry.origin();

    for i in 0..3 {
        if columns[i][i] < 0.0 {
            let n = data.len_of(Axis(2 - i));
            origin += columns[i] * (spacing[i] * (n as f64 - 1.0));
            columns[i] = -columns[i];
            data.invert_axis(Axis(2 - i));
        }
    }

    let mut direction = Matrix3::from_columns(&columns);
    if (direction - Matrix3::identity()).amax() < SNAP_TOLERANCE {
        direction = Matrix3::identity();
    }
    spacing = spacing.map(|s| s.abs());

    let slice_axis = perm.iter().position(|&p| p == 2).unwrap_or(2);
    let data = data.as_standard_layout().into_owned();
    Ok((Volume::new(data, Geometry::new(spacing, origin, direction)?)?, slice_axis))
}

/// Resample onto an identity-direction grid with `target` spacing covering
/// the physical bounding box of `volume`.
fn resample_to_identity(volume: &Volume, target: &Vector3<f64>) -> Result<Volume, GeometryError> {
    let geometry = volume.geometry();
    let size = volume.size();

    let (origin, dims) = if *geometry.direction() == Matrix3::identity() {
        let dims = Interpolator::resampled_dimensions(geometry.spacing(), &size, target);
        (*geometry.origin(), dims)
    } else {
        let mut lower = Vector3::repeat(f64::INFINITY);
        let mut upper = Vector3::repeat(f64::NEG_INFINITY);
        for corner in 0..8 {
            let index = Vector3::from_fn(|i, _| {
                if corner & (1 << i) != 0 {
                    size[i].saturating_sub(1) as f64
                } else {
                    0.0
                }
            });
            let p = geometry.index_to_physical(&index);
            lower = lower.inf(&p);
            upper = upper.sup(&p);
        }
        let dims = Vector3::from_fn(|i, _| ((upper[i] - lower[i]) / target[i] + 1e-6).floor() as usize + 1);
        (lower, dims)
    };

    let out_geometry = Geometry::axis_aligned(*target, origin)?;
    let mut data = Array3::<f32>::zeros((dims.z, dims.y, dims.x));
    Zip::indexed(&mut data).par_for_each(|(z, y, x), value| {
        let p = out_geometry.index_to_physical(&Vector3::new(x as f64, y as f64, z as f64));
        *value = volume.sample(&p, Interpolation::Linear).unwrap_or(0.0);
    });
    Volume::new(data, out_geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Stack;
    use crate::config::SequencerOptions;
    use crate::sequencer::SliceSequencer;
    use crate::slice::Slice;
    use ndarray::Array2;

    fn sequence(
        row: Vector3<f64>,
        column: Vector3<f64>,
        count: usize,
        spacing: (f64, f64, f64),
    ) -> SliceSequence {
        let normal = row.cross(&column).normalize();
        let slices = (0..count)
            .map(|i| {
                Slice::new(Array2::from_elem((6, 8), i as f32))
                    .with_orientation(row, column)
                    .with_pixel_spacing(spacing.0, spacing.1)
                    .with_position(Vector3::new(5.0, -3.0, 2.0) + normal * (i as f64 * spacing.2))
                    .with_acquisition_index(i as i32)
            })
            .collect();
        SliceSequencer::new(SequencerOptions::default())
            .sequence(Stack::new(None, Some(normal), slices), &mut Vec::new())
            .unwrap()
    }

    fn standardizer() -> VolumeStandardizer {
        VolumeStandardizer::new(StandardizerOptions {
            bias_correction: false,
            ..StandardizerOptions::default()
        })
    }

    #[test]
    fn assembles_grid_from_slice_geometry() {
        let seq = sequence(Vector3::x(), Vector3::y(), 4, (0.5, 0.25, 2.0));
        let volume = standardizer().assemble(&seq, &mut Vec::new()).unwrap();
        assert_eq!(volume.dim(), (4, 6, 8));
        assert_eq!(*volume.geometry().spacing(), Vector3::new(0.25, 0.5, 2.0));
        assert_eq!(*volume.geometry().origin(), Vector3::new(5.0, -3.0, 2.0));
        assert_eq!(volume.data()[[3, 0, 0]], 3.0);
    }

    #[test]
    fn assembled_direction_is_orthonormal_for_skewed_input() {
        let row = Vector3::new(1.0, 0.02, 0.0);
        let column = Vector3::new(0.03, 1.0, 0.1);
        let seq = sequence(row, column, 3, (1.0, 1.0, 1.0));
        let volume = standardizer().assemble(&seq, &mut Vec::new()).unwrap();
        let d = volume.geometry().direction();
        assert!(((d.transpose() * d) - Matrix3::identity()).amax() < 1e-9);
    }

    #[test]
    fn reorient_preserves_physical_positions() {
        // rows run towards -x, slices stack along +y
        let seq = sequence(-Vector3::x(), Vector3::z(), 5, (1.0, 1.0, 1.0));
        let volume = standardizer().assemble(&seq, &mut Vec::new()).unwrap();
        let probe = volume
            .geometry()
            .index_to_physical(&Vector3::new(2.0, 3.0, 4.0));
        let before = volume.sample(&probe, Interpolation::Nearest).unwrap();

        let (canonical, slice_axis) = reorient(volume).unwrap();
        assert_eq!(*canonical.geometry().direction(), Matrix3::identity());
        assert_eq!(slice_axis, 1);
        let after = canonical.sample(&probe, Interpolation::Nearest).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn isotropic_band_follows_anisotropy() {
        let standardizer = standardizer();
        assert_eq!(standardizer.isotropic_spacing(0.5, 1.2), 0.6);
        assert_eq!(standardizer.isotropic_spacing(0.7, 1.2), 0.7);
        assert_eq!(standardizer.isotropic_spacing(0.332, 2.2), 1.0);
        assert_eq!(standardizer.isotropic_spacing(1.5, 2.2), 1.2);
    }

    #[test]
    fn moderate_anisotropy_resamples_isotropically() {
        let seq = sequence(Vector3::x(), Vector3::y(), 10, (0.5, 0.5, 1.0));
        let volume = standardizer().standardize(&seq, &mut Vec::new()).unwrap();
        assert_eq!(*volume.geometry().spacing(), Vector3::repeat(1.0));
        // x: 7 * 0.5 = 3.5 mm, y: 5 * 0.5 = 2.5 mm, z: 9 mm
        assert_eq!(volume.dim(), (10, 3, 4));
    }

    #[test]
    fn thick_slices_keep_their_grid() {
        let seq = sequence(Vector3::x(), Vector3::y(), 5, (0.5, 0.5, 4.0));
        let mut warnings = Vec::new();
        let volume = standardizer().standardize(&seq, &mut warnings).unwrap();
        assert_eq!(volume.dim(), (5, 6, 8));
        assert_eq!(*volume.geometry().spacing(), Vector3::new(0.5, 0.5, 4.0));
        assert!(warnings.iter().any(|w| w.message.contains("anisotropy")));
    }

    #[test]
    fn oblique_stack_lands_on_identity_grid() {
        let angle: f64 = 0.3;
        let row = Vector3::new(angle.cos(), angle.sin(), 0.0);
        let column = Vector3::new(-angle.sin(), angle.cos(), 0.0);
        let seq = sequence(row, column, 6, (1.0, 1.0, 1.0));
        let volume = standardizer().standardize(&seq, &mut Vec::new()).unwrap();
        assert_eq!(*volume.geometry().direction(), Matrix3::identity());
        assert_eq!(*volume.geometry().spacing(), Vector3::repeat(0.8));
    }

    #[test]
    fn bias_correction_flattens_smooth_gain() {
        let geometry = Geometry::axis_aligned(Vector3::repeat(1.0), Vector3::zeros()).unwrap();
        let data = Array3::from_shape_fn((16, 32, 32), |(z, y, x)| {
            let inside = (4..28).contains(&x) && (4..28).contains(&y) && (2..14).contains(&z);
            if inside {
                100.0 * (1.0 + 0.02 * x as f32)
            } else {
                0.0
            }
        });
        let spread = |volume: &Volume| {
            let inside = volume.data().slice(s![8, 16, 4..28]);
            inside.iter().copied().fold(f32::NEG_INFINITY, f32::max)
                / inside.iter().copied().fold(f32::INFINITY, f32::min)
        };
        let volume = Volume::new(data, geometry).unwrap();
        let before = spread(&volume);
        let corrector = VolumeStandardizer::new(StandardizerOptions {
            bias_sigma: 6.0,
            bias_grid_spacing: 2.0,
            ..StandardizerOptions::default()
        });
        let corrected = corrector.correct_bias(volume).unwrap();
        assert!(spread(&corrected) < before);
    }
}
