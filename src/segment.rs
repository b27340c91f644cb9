use crate::config::SegmentationOptions;
use crate::enums::{Tissue, TissueClass};
use crate::error::ReconError;
use crate::filters::{
    gaussian_smooth, gradient_magnitude, otsu_threshold, percentile, percentile_of_sorted,
};
use crate::job::{Stage, Warning};
use crate::morphology::{close, erode, fill_holes, fill_holes_slicewise, label_components, largest_component, open};
use crate::volume::{Mask, Volume};

use nalgebra::Vector3;
use ndarray::{Array3, Axis, Zip};
use rayon::prelude::*;
use tracing::{debug, info};

const MAX_KMEANS_ITERATIONS: usize = 50;
/// Gradients below this, in normalized intensity per mm, count as flat.
const MIN_GRADIENT: f32 = 1e-2;

pub struct TissueSegmenter {
    options: SegmentationOptions,
}

/// Intermediate grids shared by every tissue of one volume.
struct Prepared<'a> {
    volume: &'a Volume,
    normalized: Array3<f32>,
    body: Array3<bool>,
    body_count: usize,
}

impl TissueSegmenter {
    pub fn new(options: SegmentationOptions) -> Self {
        Self { options }
    }

    /// One mask per tissue that produced a non-empty result.
    ///
    /// # Errors
    ///
    /// `EmptySegmentation` when every requested tissue came back empty.
    pub fn segment(
        &self,
        volume: &Volume,
        tissues: &[Tissue],
        warnings: &mut Vec<Warning>,
    ) -> Result<Vec<Mask>, ReconError> {
        let prepared = self.prepare(volume);
        debug!(body_voxels = prepared.body_count, "Body mask");

        let results: Vec<Result<Mask, ReconError>> = tissues
            .par_iter()
            .map(|&tissue| self.segment_tissue(&prepared, tissue))
            .collect();

        let mut masks = Vec::new();
        for result in results {
            match result {
                Ok(mask) => {
                    info!(tissue = %mask.tissue(), voxels = mask.count(), "Segmented tissue");
                    masks.push(mask);
                }
                Err(e) => Warning::record(warnings, Stage::Segment, e.to_string()),
            }
        }

        if masks.is_empty() {
            return Err(ReconError::EmptySegmentation);
        }
        Ok(masks)
    }

    fn prepare<'a>(&self, volume: &'a Volume) -> Prepared<'a> {
        let normalized = self.normalize(volume.data());

        let smoothed = gaussian_smooth(&normalized, &Vector3::repeat(self.options.body_sigma));
        let values: Vec<f32> = smoothed.iter().copied().collect();
        let threshold = otsu_threshold(&values);
        let foreground = smoothed.mapv(|v| v > threshold);
        let closed = fill_holes(&close(&foreground, 2));
        let body = largest_component(&fill_holes_slicewise(&closed, Axis(0)));
        let body_count = body.iter().filter(|&&b| b).count();

        Prepared {
            volume,
            normalized,
            body,
            body_count,
        }
    }

    /// Map the configured percentile range onto `[0, 1]`.
    fn normalize(&self, data: &Array3<f32>) -> Array3<f32> {
        let (low_p, high_p) = self.options.normalization_percentiles;
        let mut sorted: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
        sorted.sort_unstable_by(f32::total_cmp);
        if sorted.is_empty() {
            return Array3::zeros(data.dim());
        }
        let low = percentile_of_sorted(&sorted, low_p);
        let high = percentile_of_sorted(&sorted, high_p);
        let range = high - low;
        if !(range > 0.0) {
            return Array3::zeros(data.dim());
        }
        data.mapv(|v| ((v - low) / range).clamp(0.0, 1.0))
    }

    fn segment_tissue(&self, prepared: &Prepared, tissue: Tissue) -> Result<Mask, ReconError> {
        let empty = || ReconError::SegmentationEmpty { tissue };
        if prepared.body_count == 0 {
            return Err(empty());
        }

        let raw = match tissue.class() {
            TissueClass::HardBoundary => self.hard_boundary(prepared),
            TissueClass::SoftTissue => self.soft_tissue(prepared),
        };
        let filtered = self.filter_components(&raw, prepared.volume);
        let mask = Mask::new(filtered, prepared.volume.geometry().clone(), tissue);
        if mask.is_empty() {
            return Err(empty());
        }
        Ok(mask)
    }

    /// Strong gradients inside the body where the signal is not among the
    /// brightest, closed and filled into solid structures.
    fn hard_boundary(&self, prepared: &Prepared) -> Array3<bool> {
        let options = &self.options;
        let spacing = prepared.volume.geometry().spacing();
        let min_spacing = spacing.min();
        let gradient = gradient_magnitude(&prepared.normalized, spacing);
        // one extra voxel for the reach of the central-difference stencil
        let margin = (options.body_margin / min_spacing).ceil() as usize + 1;
        let interior = erode(&prepared.body, margin);

        let inverted = prepared.normalized.mapv(|v| 1.0 - v);
        let inside = |grid: &Array3<f32>| {
            Zip::from(grid)
                .and(&interior)
                .fold(Vec::new(), |mut acc, &v, &keep| {
                    if keep {
                        acc.push(v);
                    }
                    acc
                })
        };
        let low_signal = percentile(inside(&inverted), options.low_signal_percentile).unwrap_or(0.0);
        let gradients = inside(&gradient);

        let (low, high) = options.coverage_band;
        let mut gradient_percentile = options.gradient_percentile;
        let mut mask = Array3::from_elem(prepared.body.dim(), false);
        // one retune pass when the coverage misses the band
        for pass in 0..2 {
            let threshold = percentile(gradients.iter().copied(), gradient_percentile)
                .unwrap_or(0.0)
                .max(MIN_GRADIENT);
            let mut shell = Array3::from_elem(prepared.body.dim(), false);
            Zip::from(&mut shell)
                .and(&interior)
                .and(&gradient)
                .and(&inverted)
                .par_for_each(|s, &keep, &g, &inv| {
                    *s = keep && g > threshold && inv >= low_signal;
                });

            let solid = fill_holes(&fill_holes_slicewise(&close(&shell, 1), Axis(0)));
            mask = open(&solid, 1);
            Zip::from(&mut mask).and(&prepared.body).for_each(|m, &b| *m &= b);

            let coverage = mask.iter().filter(|&&m| m).count() as f64 / prepared.body_count as f64;
            debug!(pass, gradient_percentile, threshold, coverage, "Hard-boundary coverage");
            if pass == 1 || (low..=high).contains(&coverage) {
                break;
            }
            gradient_percentile = if coverage < low {
                (gradient_percentile - 10.0).max(50.0)
            } else {
                (gradient_percentile + 7.0).min(99.0)
            };
        }
        mask
    }

    /// 1D k-means on body intensities; keep the cluster of the configured rank.
    fn soft_tissue(&self, prepared: &Prepared) -> Array3<bool> {
        let values: Vec<f32> = Zip::from(&prepared.normalized)
            .and(&prepared.body)
            .fold(Vec::new(), |mut acc, &v, &b| {
                if b {
                    acc.push(v);
                }
                acc
            });
        let centers = kmeans_1d(&values, self.options.clusters);
        let rank = self.options.soft_tissue_rank.min(centers.len().saturating_sub(1));
        let nearest = |v: f32| {
            centers
                .iter()
                .enumerate()
                .min_by(|a, b| (v - a.1).abs().total_cmp(&(v - b.1).abs()))
                .map(|(i, _)| i)
        };

        let mut mask = Array3::from_elem(prepared.body.dim(), false);
        Zip::from(&mut mask)
            .and(&prepared.normalized)
            .and(&prepared.body)
            .par_for_each(|m, &v, &b| *m = b && nearest(v) == Some(rank));
        open(&mask, 1)
    }

    /// Keep up to `max_components` components above the minimum size,
    /// preferring large ones near the volume centre.
    fn filter_components(&self, mask: &Array3<bool>, volume: &Volume) -> Array3<bool> {
        let (labels, components) = label_components(mask);
        let total: usize = components.iter().map(|c| c.size).sum();
        if total == 0 {
            return mask.clone();
        }

        let spacing = volume.geometry().spacing();
        let (depth, height, width) = volume.dim();
        let centre = Vector3::new(width as f64 - 1.0, height as f64 - 1.0, depth as f64 - 1.0) / 2.0;
        let max_distance = centre.component_mul(spacing).norm().max(f64::EPSILON);
        let min_size = (self.options.min_component_fraction * total as f64).ceil() as usize;

        let mut scored: Vec<(f64, u32)> = components
            .iter()
            .filter(|c| c.size >= min_size.max(1))
            .map(|c| {
                let [z, y, x] = c.centroid;
                let offset = (Vector3::new(x, y, z) - centre).component_mul(spacing);
                let distance = (offset.norm() / max_distance).min(1.0);
                let score = c.size as f64 * (1.0 - self.options.center_weight * distance);
                (score, c.label)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(self.options.max_components);
        debug!(components = components.len(), kept = scored.len(), "Component filter");

        let keep: Vec<u32> = scored.into_iter().map(|(_, label)| label).collect();
        labels.mapv(|l| l != 0 && keep.contains(&l))
    }
}

/// Deterministic 1D k-means; centres start evenly spaced over the value
/// range and come back sorted ascending.
pub fn kmeans_1d(values: &[f32], k: usize) -> Vec<f32> {
    let mut sorted: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() || k == 0 {
        return Vec::new();
    }
    sorted.sort_unstable_by(f32::total_cmp);
    let (min, max) = (sorted[0], sorted[sorted.len() - 1]);
    let mut centers: Vec<f32> = (0..k)
        .map(|i| min + (max - min) * (i as f32 + 0.5) / k as f32)
        .collect();

    for _ in 0..MAX_KMEANS_ITERATIONS {
        let mut sums = vec![0.0_f64; k];
        let mut counts = vec![0usize; k];
        for &v in &sorted {
            let nearest = (0..k)
                .min_by(|&a, &b| (v - centers[a]).abs().total_cmp(&(v - centers[b]).abs()))
                .unwrap_or(0);
            sums[nearest] += v as f64;
            counts[nearest] += 1;
        }
        let updated: Vec<f32> = (0..k)
            .map(|i| {
                if counts[i] > 0 {
                    (sums[i] / counts[i] as f64) as f32
                } else {
                    centers[i]
                }
            })
            .collect();
        let moved = updated
            .iter()
            .zip(&centers)
            .any(|(a, b)| (a - b).abs() > 1e-6);
        centers = updated;
        if !moved {
            break;
        }
    }
    centers.sort_unstable_by(f32::total_cmp);
    centers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Geometry;

    /// Bright body cylinder along z with a dark rod and a mid-grey block.
    fn phantom() -> Volume {
        let geometry = Geometry::axis_aligned(Vector3::repeat(1.0), Vector3::zeros()).unwrap();
        let data = Array3::from_shape_fn((24, 48, 48), |(_, y, x)| {
            let (dx, dy) = (x as f64 - 23.5, y as f64 - 23.5);
            let r = (dx * dx + dy * dy).sqrt();
            if r < 4.0 {
                20.0
            } else if r < 22.0 {
                if dx > 6.0 && dy.abs() < 5.0 { 60.0 } else { 100.0 }
            } else {
                0.0
            }
        });
        Volume::new(data, geometry).unwrap()
    }

    fn segmenter() -> TissueSegmenter {
        TissueSegmenter::new(SegmentationOptions::default())
    }

    #[test]
    fn kmeans_finds_three_levels() {
        let mut values = vec![0.0_f32; 100];
        values.extend(std::iter::repeat_n(0.5, 100));
        values.extend(std::iter::repeat_n(1.0, 100));
        let centers = kmeans_1d(&values, 3);
        assert_eq!(centers.len(), 3);
        assert!((centers[0] - 0.0).abs() < 1e-6);
        assert!((centers[1] - 0.5).abs() < 1e-6);
        assert!((centers[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn hard_boundary_finds_central_rod() {
        let volume = phantom();
        let masks = segmenter()
            .segment(&volume, &[Tissue::Bone], &mut Vec::new())
            .unwrap();
        let bone = &masks[0];
        assert_eq!(bone.tissue(), Tissue::Bone);
        assert!(bone.data()[[12, 24, 24]]);
        assert!(!bone.data()[[12, 24, 38]]);
        assert!(!bone.data()[[12, 2, 2]]);
    }

    #[test]
    fn soft_tissue_picks_middle_intensity() {
        let volume = phantom();
        let masks = segmenter()
            .segment(&volume, &[Tissue::Muscle], &mut Vec::new())
            .unwrap();
        let muscle = &masks[0];
        assert!(muscle.data()[[12, 24, 33]]);
        assert!(!muscle.data()[[12, 24, 10]]);
    }

    #[test]
    fn empty_volume_fails_all_tissues() {
        let geometry = Geometry::axis_aligned(Vector3::repeat(1.0), Vector3::zeros()).unwrap();
        let volume = Volume::new(Array3::zeros((8, 8, 8)), geometry).unwrap();
        let mut warnings = Vec::new();
        let err = segmenter()
            .segment(&volume, &[Tissue::Bone, Tissue::Muscle], &mut warnings)
            .unwrap_err();
        assert!(matches!(err, ReconError::EmptySegmentation));
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn component_filter_drops_small_peripheral_blobs() {
        let volume = phantom();
        let mut mask = Array3::from_elem(volume.dim(), false);
        for z in 8..16 {
            for y in 20..28 {
                for x in 20..28 {
                    mask[[z, y, x]] = true;
                }
            }
        }
        mask[[0, 0, 0]] = true;
        let filtered = segmenter().filter_components(&mask, &volume);
        assert!(!filtered[[0, 0, 0]]);
        assert!(filtered[[10, 24, 24]]);
    }
}
