use crate::enums::Tissue;
use thiserror::Error;

/// Invalid or degenerate spatial metadata. Fatal for the stack it occurs in.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Slice orientation vectors are degenerate (zero-length normal)")]
    DegenerateOrientation,

    #[error("Direction matrix is not orthonormal")]
    NonOrthonormalDirection,

    #[error("Non-positive spacing {value} along axis {axis}")]
    NonPositiveSpacing { axis: usize, value: f64 },

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Too few slices for a volume: found {found}, need {required}")]
    TooFewSlices { found: usize, required: usize },

    #[error("Transform is not invertible")]
    NonInvertibleTransform,
}

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),

    #[error("Registration failed: {reason}")]
    RegistrationFailure { reason: String },

    #[error("Segmentation of {tissue} produced an empty mask")]
    SegmentationEmpty { tissue: Tissue },

    #[error("No usable slice geometry in the input")]
    NoUsableGeometry,

    #[error("Segmentation produced no mask for any requested tissue")]
    EmptySegmentation,

    #[error("Reconstruction was cancelled")]
    Cancelled,

    #[error("Job has already run")]
    AlreadyRun,

    #[error("Export error: {0}")]
    Export(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReconError {
    /// Whether this error terminates the Job rather than just one stack,
    /// volume or tissue.
    pub fn is_job_fatal(&self) -> bool {
        !matches!(
            self,
            ReconError::Geometry(_)
                | ReconError::RegistrationFailure { .. }
                | ReconError::SegmentationEmpty { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_item_errors_are_not_job_fatal() {
        assert!(!ReconError::from(GeometryError::DegenerateOrientation).is_job_fatal());
        assert!(
            !ReconError::SegmentationEmpty {
                tissue: Tissue::Muscle
            }
            .is_job_fatal()
        );
        assert!(ReconError::NoUsableGeometry.is_job_fatal());
        assert!(ReconError::EmptySegmentation.is_job_fatal());
        assert!(ReconError::Cancelled.is_job_fatal());
    }

    #[test]
    fn messages_name_the_tissue() {
        let err = ReconError::SegmentationEmpty {
            tissue: Tissue::Bone,
        };
        assert_eq!(err.to_string(), "Segmentation of bone produced an empty mask");
    }
}
