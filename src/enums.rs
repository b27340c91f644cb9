use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Anatomical plane of a stack, taken from the dominant axis of its normal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

impl Orientation {
    pub fn from_normal(normal: &Vector3<f64>) -> Self {
        let (x, y, z) = (normal.x.abs(), normal.y.abs(), normal.z.abs());
        if z >= x && z >= y {
            Orientation::Axial
        } else if y >= x {
            Orientation::Coronal
        } else {
            Orientation::Sagittal
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
}

/// Where a slice's position along the stack normal came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    /// Fitted from the acquisition index against positioned neighbours.
    InterpolatedFromIndex,
    InstanceNumber,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tissue {
    Bone,
    Muscle,
}

/// How a tissue is separated from its surroundings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TissueClass {
    /// Structure with sharp intensity boundaries, found through gradients.
    HardBoundary,
    /// Structure found by intensity clustering.
    SoftTissue,
}

impl Tissue {
    pub fn name(&self) -> &'static str {
        match self {
            Tissue::Bone => "bone",
            Tissue::Muscle => "muscle",
        }
    }

    pub fn class(&self) -> TissueClass {
        match self {
            Tissue::Bone => TissueClass::HardBoundary,
            Tissue::Muscle => TissueClass::SoftTissue,
        }
    }
}

impl fmt::Display for Tissue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tissue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bone" => Ok(Tissue::Bone),
            "muscle" => Ok(Tissue::Muscle),
            other => Err(format!("unknown tissue '{other}' (expected bone or muscle)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_follows_dominant_normal_axis() {
        assert_eq!(
            Orientation::from_normal(&Vector3::new(0.0, 0.1, 0.99)),
            Orientation::Axial
        );
        assert_eq!(
            Orientation::from_normal(&Vector3::new(0.0, -1.0, 0.0)),
            Orientation::Coronal
        );
        assert_eq!(
            Orientation::from_normal(&Vector3::new(-0.9, 0.3, 0.1)),
            Orientation::Sagittal
        );
    }

    #[test]
    fn tissue_parses_case_insensitively() {
        assert_eq!("Bone".parse::<Tissue>(), Ok(Tissue::Bone));
        assert_eq!(" muscle ".parse::<Tissue>(), Ok(Tissue::Muscle));
        assert!("liver".parse::<Tissue>().is_err());
    }
}
