use crate::classifier::Stack;
use crate::config::SequencerOptions;
use crate::enums::SortBy;
use crate::error::{GeometryError, ReconError};
use crate::filters::median;
use crate::job::{Stage, Warning};
use crate::slice::Slice;

use nalgebra::Vector3;
use tracing::{debug, info};

/// Ordered, outlier-pruned slices of one stack.
#[derive(Clone, Debug)]
pub struct SliceSequence {
    normal: Option<Vector3<f64>>,
    slices: Vec<Slice>,
    keys: Vec<f64>,
    sort_by: Vec<SortBy>,
    slice_spacing: f64,
}

impl SliceSequence {
    pub fn normal(&self) -> Option<&Vector3<f64>> {
        self.normal.as_ref()
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    /// Position of each slice along the normal, in mm, ascending.
    pub fn keys(&self) -> &[f64] {
        &self.keys
    }

    /// Where each slice's key came from.
    pub fn sort_by(&self) -> &[SortBy] {
        &self.sort_by
    }

    /// Median of the remaining consecutive key deltas, in mm.
    pub fn slice_spacing(&self) -> f64 {
        self.slice_spacing
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

struct Keyed {
    key: f64,
    sort_by: SortBy,
    slice: Slice,
}

pub struct SliceSequencer {
    options: SequencerOptions,
}

impl SliceSequencer {
    pub fn new(options: SequencerOptions) -> Self {
        Self { options }
    }

    /// Orders a stack along its normal and removes spatial outliers.
    ///
    /// # Errors
    ///
    /// `TooFewSlices` when fewer than `min_slices` slices remain.
    pub fn sequence(
        &self,
        stack: Stack,
        warnings: &mut Vec<Warning>,
    ) -> Result<SliceSequence, ReconError> {
        let normal = stack.normal().copied();
        let mut keyed = self.assign_keys(normal.as_ref(), stack.into_slices(), warnings);

        // stable, so equal keys keep acquisition order
        keyed.sort_by(|a, b| {
            a.key
                .total_cmp(&b.key)
                .then(a.slice.acquisition_index().cmp(&b.slice.acquisition_index()))
        });

        let required = self.options.min_slices;
        if keyed.len() < required {
            return Err(GeometryError::TooFewSlices {
                found: keyed.len(),
                required,
            }
            .into());
        }

        let keyed = self.remove_outliers(keyed, warnings);
        let keys: Vec<f64> = keyed.iter().map(|k| k.key).collect();
        let deltas: Vec<f64> = keys.windows(2).map(|w| w[1] - w[0]).collect();

        let slice_spacing = match median(&deltas) {
            Some(spacing) if spacing > f64::EPSILON => spacing,
            _ => {
                Warning::record(
                    warnings,
                    Stage::Sequence,
                    format!(
                        "Slices share one position; assuming {} mm spacing",
                        self.options.fallback_slice_spacing
                    ),
                );
                self.options.fallback_slice_spacing
            }
        };
        log_spacing_quality(&deltas, slice_spacing);

        if keyed.len() < required {
            return Err(GeometryError::TooFewSlices {
                found: keyed.len(),
                required,
            }
            .into());
        }

        let (sort_by, slices) = keyed.into_iter().map(|k| (k.sort_by, k.slice)).unzip();
        Ok(SliceSequence {
            normal,
            slices,
            keys,
            sort_by,
            slice_spacing,
        })
    }

    /// Key = `normal · position`. Slices without a position get a key from a
    /// line fitted through (acquisition index, key) of positioned slices.
    fn assign_keys(
        &self,
        normal: Option<&Vector3<f64>>,
        slices: Vec<Slice>,
        warnings: &mut Vec<Warning>,
    ) -> Vec<Keyed> {
        let position_key = |slice: &Slice| match (normal, slice.position()) {
            (Some(n), Some(p)) => Some(n.dot(p)),
            _ => None,
        };

        let anchors: Vec<(f64, f64)> = slices
            .iter()
            .filter_map(|s| Some((s.acquisition_index()? as f64, position_key(s)?)))
            .collect();
        let any_positioned = slices.iter().any(|s| position_key(s).is_some());
        let fallback = self.options.fallback_slice_spacing;

        let fit = match anchors.as_slice() {
            [] => None,
            [(index, key)] => Some((fallback, key - fallback * index)),
            _ => fit_line(&anchors),
        };

        if !any_positioned {
            Warning::record(
                warnings,
                Stage::Sequence,
                format!(
                    "No slice position available; ordering {} slices by acquisition index",
                    slices.len()
                ),
            );
        }

        let mut interpolated = 0usize;
        let mut keyed = Vec::with_capacity(slices.len());
        for slice in slices {
            if let Some(key) = position_key(&slice) {
                keyed.push(Keyed {
                    key,
                    sort_by: SortBy::ImagePositionPatient,
                    slice,
                });
                continue;
            }
            let Some(index) = slice.acquisition_index().map(f64::from) else {
                Warning::record(
                    warnings,
                    Stage::Sequence,
                    format!("Dropped {}: no position and no acquisition index", slice.label()),
                );
                continue;
            };
            if !any_positioned {
                keyed.push(Keyed {
                    key: index * fallback,
                    sort_by: SortBy::InstanceNumber,
                    slice,
                });
            } else if let Some((slope, intercept)) = fit {
                interpolated += 1;
                keyed.push(Keyed {
                    key: slope.mul_add(index, intercept),
                    sort_by: SortBy::InterpolatedFromIndex,
                    slice,
                });
            } else {
                Warning::record(
                    warnings,
                    Stage::Sequence,
                    format!(
                        "Dropped {}: no position and no positioned neighbour to align with",
                        slice.label()
                    ),
                );
            }
        }

        if interpolated > 0 {
            Warning::record(
                warnings,
                Stage::Sequence,
                format!("{interpolated} slices without position placed by acquisition index"),
            );
        }
        keyed
    }

    /// Drops slices that sit closer to the previous kept slice than the
    /// median delta allows, and stray end slices beyond a gap.
    fn remove_outliers(&self, keyed: Vec<Keyed>, warnings: &mut Vec<Warning>) -> Vec<Keyed> {
        let deltas: Vec<f64> = keyed.windows(2).map(|w| w[1].key - w[0].key).collect();
        let Some(median_delta) = median(&deltas).filter(|m| *m > f64::EPSILON) else {
            return keyed;
        };
        let tolerance = self.options.outlier_tolerance;
        let too_close = median_delta * (1.0 - tolerance);
        let too_far = median_delta * (1.0 + tolerance);

        let n = keyed.len();
        let mut keep = vec![true; n];
        let mut last = 0;
        for i in 1..n {
            if keyed[i].key - keyed[last].key < too_close {
                keep[i] = false;
            } else {
                last = i;
            }
        }
        let kept: Vec<usize> = (0..n).filter(|&i| keep[i]).collect();
        if kept.len() >= 3 {
            let (first, second) = (kept[0], kept[1]);
            if keyed[second].key - keyed[first].key > too_far {
                keep[first] = false;
            }
            let (before_last, last) = (kept[kept.len() - 2], kept[kept.len() - 1]);
            if keyed[last].key - keyed[before_last].key > too_far {
                keep[last] = false;
            }
        }

        let removed = keep.iter().filter(|k| !**k).count();
        if removed == 0 {
            return keyed;
        }
        let limit = (n as f64 * self.options.max_outlier_fraction).floor() as usize;
        if removed > limit {
            Warning::record(
                warnings,
                Stage::Sequence,
                format!(
                    "Irregular slice spacing: {removed} of {n} slices look like outliers; keeping the stack unmodified"
                ),
            );
            return keyed;
        }

        Warning::record(
            warnings,
            Stage::Sequence,
            format!("Removed {removed} outlier slices of {n}"),
        );
        keyed
            .into_iter()
            .zip(keep)
            .filter_map(|(k, keep)| keep.then_some(k))
            .collect()
    }
}

/// Least-squares `key = slope * index + intercept`.
fn fit_line(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

fn log_spacing_quality(deltas: &[f64], spacing: f64) {
    if deltas.is_empty() {
        return;
    }
    let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
    let variance = deltas.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / deltas.len() as f64;
    let cv = if mean.abs() > f64::EPSILON {
        variance.sqrt() / mean.abs()
    } else {
        0.0
    };
    info!(slices = deltas.len() + 1, spacing, "Sequenced stack");
    debug!(mean_delta = mean, coefficient_of_variation = cv, "Slice spacing");
}
