//! Reconstruction parameters
//!
//! Every stage is constructed from its own section of [`ReconOptions`]. All
//! fields have defaults, so a TOML file only needs to name what it changes:
//!
//! ```toml
//! [classifier]
//! cosine_tolerance = 2e-3
//!
//! [segmentation]
//! tissues = ["bone", "muscle"]
//! ```

use crate::enums::Tissue;
use crate::error::ReconError;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconOptions {
    pub classifier: ClassifierOptions,
    pub sequencer: SequencerOptions,
    pub standardizer: StandardizerOptions,
    pub registration: RegistrationOptions,
    pub segmentation: SegmentationOptions,
    pub surface: SurfaceOptions,
    pub finishing: FinishingOptions,
    pub export: ExportOptions,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifierOptions {
    /// Slices join a stack when `1 - |cos(angle between normals)|` is below this.
    pub cosine_tolerance: f64,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        Self {
            cosine_tolerance: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SequencerOptions {
    /// Allowed relative deviation of a slice delta from the median delta.
    pub outlier_tolerance: f64,
    /// Largest share of a stack that outlier removal may drop.
    pub max_outlier_fraction: f64,
    pub min_slices: usize,
    /// Slice spacing in mm assumed when no slice carries a position.
    pub fallback_slice_spacing: f64,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            outlier_tolerance: 0.2,
            max_outlier_fraction: 0.25,
            min_slices: 3,
            fallback_slice_spacing: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StandardizerOptions {
    pub bias_correction: bool,
    /// Block size of the grid the bias field is estimated on, in mm.
    pub bias_grid_spacing: f64,
    /// Smoothness of the bias field, in mm.
    pub bias_sigma: f64,
    /// Through-plane / in-plane ratio above which slices count as thick.
    pub thick_slice_ratio: f64,
    /// Ratio above which a high-anisotropy warning is recorded.
    pub anisotropy_warning_ratio: f64,
    /// In-plane smoothing of thick-slice volumes, in voxels.
    pub thick_slice_sigma: f64,
    /// Ratio up to which the fine isotropic band is used.
    pub near_isotropic_ratio: f64,
    pub fine_band: (f64, f64),
    pub coarse_band: (f64, f64),
    /// In-plane spacing in mm assumed for slices without `PixelSpacing`.
    pub fallback_pixel_spacing: f64,
}

impl Default for StandardizerOptions {
    fn default() -> Self {
        Self {
            bias_correction: true,
            bias_grid_spacing: 4.0,
            bias_sigma: 30.0,
            thick_slice_ratio: 3.0,
            anisotropy_warning_ratio: 3.0,
            thick_slice_sigma: 0.5,
            near_isotropic_ratio: 1.5,
            fine_band: (0.6, 0.8),
            coarse_band: (1.0, 1.2),
            fallback_pixel_spacing: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrationOptions {
    pub histogram_bins: usize,
    /// Sampling strides of the coarse-to-fine levels.
    pub shrink_factors: Vec<usize>,
    /// Upper bound on metric samples per level.
    pub max_samples: usize,
    /// Initial optimizer step, in mm.
    pub max_step: f64,
    pub min_step: f64,
    pub max_iterations: usize,
    /// Mutual information (nats) a result needs to be accepted.
    pub min_mutual_information: f64,
    /// Share of samples that must land inside the moving volume.
    pub min_overlap: f64,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            histogram_bins: 32,
            shrink_factors: vec![4, 2, 1],
            max_samples: 20_000,
            max_step: 4.0,
            min_step: 1e-3,
            max_iterations: 200,
            min_mutual_information: 0.05,
            min_overlap: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SegmentationOptions {
    pub tissues: Vec<Tissue>,
    /// Lower and upper intensity percentiles mapped to 0 and 1.
    pub normalization_percentiles: (f64, f64),
    /// Body-mask smoothing, in voxels.
    pub body_sigma: f64,
    /// Distance kept clear of the body outline for hard-boundary tissue, in mm.
    pub body_margin: f64,
    pub gradient_percentile: f64,
    /// Percentile of inverted intensity a hard-boundary voxel must reach.
    pub low_signal_percentile: f64,
    /// Accepted hard-boundary share of body voxels.
    pub coverage_band: (f64, f64),
    pub clusters: usize,
    /// Intensity rank (0 = darkest) of the soft-tissue cluster.
    pub soft_tissue_rank: usize,
    pub min_component_fraction: f64,
    pub max_components: usize,
    /// Score penalty for components far from the volume centre.
    pub center_weight: f64,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        Self {
            tissues: vec![Tissue::Bone],
            normalization_percentiles: (5.0, 95.0),
            body_sigma: 1.0,
            body_margin: 2.0,
            gradient_percentile: 85.0,
            low_signal_percentile: 8.0,
            coverage_band: (0.008, 0.08),
            clusters: 3,
            soft_tissue_rank: 1,
            min_component_fraction: 0.05,
            max_components: 3,
            center_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SurfaceOptions {
    pub iso_level: f32,
    /// Blur applied to the cropped mask before extraction, in voxels.
    pub blur_sigma: f64,
    /// Margin kept around the mask bounding box, in mm.
    pub crop_margin: f64,
    /// Physical length unit to display unit (mm to m).
    pub unit_scale: f64,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self {
            iso_level: 0.5,
            blur_sigma: 0.6,
            crop_margin: 15.0,
            unit_scale: 0.001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FinishingOptions {
    pub smoothing_iterations: usize,
    pub taubin_lambda: f64,
    pub taubin_mu: f64,
    /// Share of faces removed by decimation.
    pub target_reduction: f64,
    /// Decimation never goes below this many vertices.
    pub min_vertices: usize,
}

impl Default for FinishingOptions {
    fn default() -> Self {
        Self {
            smoothing_iterations: 10,
            taubin_lambda: 0.5,
            taubin_mu: -0.53,
            target_reduction: 0.5,
            min_vertices: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Store glTF geometry with `KHR_mesh_quantization`.
    pub quantize: bool,
}

impl ReconOptions {
    pub fn from_toml_str(source: &str) -> Result<Self, ReconError> {
        let options: Self =
            toml::from_str(source).map_err(|e| ReconError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReconError> {
        let source = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    /// Rejects values no stage can work with.
    pub fn validate(&self) -> Result<(), ReconError> {
        let invalid = |field: &str, reason: &str| {
            Err(ReconError::Config(format!("{field}: {reason}")))
        };
        let positive = |value: f64| value > 0.0 && value.is_finite();
        let percentile = |value: f64| value > 0.0 && value < 100.0;

        if !(self.classifier.cosine_tolerance > 0.0 && self.classifier.cosine_tolerance < 1.0) {
            return invalid("classifier.cosine_tolerance", "must be in (0, 1)");
        }

        let sequencer = &self.sequencer;
        if !positive(sequencer.outlier_tolerance) {
            return invalid("sequencer.outlier_tolerance", "must be positive");
        }
        if !(0.0..1.0).contains(&sequencer.max_outlier_fraction) {
            return invalid("sequencer.max_outlier_fraction", "must be in [0, 1)");
        }
        if sequencer.min_slices < 2 {
            return invalid("sequencer.min_slices", "must be at least 2");
        }
        if !positive(sequencer.fallback_slice_spacing) {
            return invalid("sequencer.fallback_slice_spacing", "must be positive");
        }

        let standardizer = &self.standardizer;
        for (field, value) in [
            ("standardizer.bias_grid_spacing", standardizer.bias_grid_spacing),
            ("standardizer.bias_sigma", standardizer.bias_sigma),
            ("standardizer.thick_slice_ratio", standardizer.thick_slice_ratio),
            ("standardizer.anisotropy_warning_ratio", standardizer.anisotropy_warning_ratio),
            ("standardizer.near_isotropic_ratio", standardizer.near_isotropic_ratio),
            ("standardizer.fallback_pixel_spacing", standardizer.fallback_pixel_spacing),
        ] {
            if !positive(value) {
                return invalid(field, "must be positive");
            }
        }
        for (field, (low, high)) in [
            ("standardizer.fine_band", standardizer.fine_band),
            ("standardizer.coarse_band", standardizer.coarse_band),
        ] {
            if !positive(low) || high < low {
                return invalid(field, "must be a positive range");
            }
        }

        let registration = &self.registration;
        if registration.histogram_bins < 2 {
            return invalid("registration.histogram_bins", "must be at least 2");
        }
        if registration.shrink_factors.is_empty() || registration.shrink_factors.contains(&0) {
            return invalid("registration.shrink_factors", "must be non-empty and positive");
        }
        if !positive(registration.max_step) || !positive(registration.min_step) {
            return invalid("registration.max_step", "steps must be positive");
        }
        if registration.max_iterations == 0 {
            return invalid("registration.max_iterations", "must be at least 1");
        }
        if !(0.0..=1.0).contains(&registration.min_overlap) {
            return invalid("registration.min_overlap", "must be in [0, 1]");
        }

        let segmentation = &self.segmentation;
        if segmentation.tissues.is_empty() {
            return invalid("segmentation.tissues", "at least one tissue is required");
        }
        let (low, high) = segmentation.normalization_percentiles;
        if !percentile(low) || !percentile(high) || high <= low {
            return invalid("segmentation.normalization_percentiles", "must be in (0, 100)");
        }
        for (field, value) in [
            ("segmentation.gradient_percentile", segmentation.gradient_percentile),
            ("segmentation.low_signal_percentile", segmentation.low_signal_percentile),
        ] {
            if !percentile(value) {
                return invalid(field, "must be in (0, 100)");
            }
        }
        if segmentation.clusters < 2 || segmentation.soft_tissue_rank >= segmentation.clusters {
            return invalid("segmentation.clusters", "need at least 2 clusters and a valid rank");
        }
        if segmentation.max_components == 0 {
            return invalid("segmentation.max_components", "must be positive");
        }

        let surface = &self.surface;
        if !positive(surface.unit_scale) {
            return invalid("surface.unit_scale", "must be positive");
        }
        if !(surface.iso_level > 0.0 && surface.iso_level < 1.0) {
            return invalid("surface.iso_level", "must be in (0, 1)");
        }
        for (field, value) in [
            ("surface.blur_sigma", surface.blur_sigma),
            ("surface.crop_margin", surface.crop_margin),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return invalid(field, "must be zero or positive");
            }
        }

        let finishing = &self.finishing;
        if !(0.0..1.0).contains(&finishing.target_reduction) {
            return invalid("finishing.target_reduction", "must be in [0, 1)");
        }
        if !(finishing.taubin_lambda > 0.0 && finishing.taubin_lambda < 1.0) {
            return invalid("finishing.taubin_lambda", "must be in (0, 1)");
        }
        // the inflating step has to outweigh the shrinking one
        if !(finishing.taubin_mu > -1.0 && finishing.taubin_mu <= -finishing.taubin_lambda) {
            return invalid("finishing.taubin_mu", "must be in (-1, -taubin_lambda]");
        }
        if finishing.min_vertices < 3 {
            return invalid("finishing.min_vertices", "must be at least 3");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        assert!(ReconOptions::default().validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let options = ReconOptions::from_toml_str(
            r#"
            [classifier]
            cosine_tolerance = 0.002

            [segmentation]
            tissues = ["bone", "muscle"]
            "#,
        )
        .unwrap();
        assert_eq!(options.classifier.cosine_tolerance, 0.002);
        assert_eq!(options.segmentation.tissues, vec![Tissue::Bone, Tissue::Muscle]);
        assert_eq!(options.sequencer, SequencerOptions::default());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = ReconOptions::from_toml_str("[finishing]\ntarget_reduction = 1.5").unwrap_err();
        assert!(err.to_string().contains("finishing.target_reduction"));

        let err = ReconOptions::from_toml_str("[segmentation]\ntissues = []").unwrap_err();
        assert!(matches!(err, ReconError::Config(_)));
    }

    #[test]
    fn rejects_unusable_surface_and_finishing_values() {
        for (source, field) in [
            ("[surface]\nblur_sigma = -0.5", "surface.blur_sigma"),
            ("[surface]\ncrop_margin = -1.0", "surface.crop_margin"),
            ("[surface]\niso_level = 1.0", "surface.iso_level"),
            ("[finishing]\ntaubin_lambda = 0.0", "finishing.taubin_lambda"),
            ("[finishing]\ntaubin_mu = 0.2", "finishing.taubin_mu"),
            ("[finishing]\nmin_vertices = 0", "finishing.min_vertices"),
            ("[registration]\nmax_iterations = 0", "registration.max_iterations"),
        ] {
            let err = ReconOptions::from_toml_str(source).unwrap_err();
            assert!(err.to_string().contains(field), "{source}: {err}");
        }
    }

    #[test]
    fn zero_blur_is_allowed() {
        let options = ReconOptions::from_toml_str("[surface]\nblur_sigma = 0.0").unwrap();
        assert_eq!(options.surface.blur_sigma, 0.0);
    }

    #[test]
    fn rejects_unknown_tissue() {
        assert!(ReconOptions::from_toml_str("[segmentation]\ntissues = [\"liver\"]").is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[export]\nquantize = true").unwrap();
        let options = ReconOptions::load(file.path()).unwrap();
        assert!(options.export.quantize);
    }
}
