use crate::enums::{Interpolation, Tissue};
use crate::error::GeometryError;
use crate::interpolator::Interpolator;

use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;

/// Maximum deviation of `DᵀD` from the identity still accepted as orthonormal.
pub const ORTHONORMAL_TOLERANCE: f64 = 1e-4;

/// Mapping between grid indices and physical (patient) space.
///
/// Grid axes are `(x, y, z)` = (column, row, slice). Column `i` of
/// `direction` is the physical direction of grid axis `i`, and
/// `physical = origin + direction * diag(spacing) * index`.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    spacing: Vector3<f64>,
    origin: Vector3<f64>,
    direction: Matrix3<f64>,
}

impl Geometry {
    pub fn new(
        spacing: Vector3<f64>,
        origin: Vector3<f64>,
        direction: Matrix3<f64>,
    ) -> Result<Self, GeometryError> {
        let geometry = Self {
            spacing,
            origin,
            direction,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Axis-aligned geometry with the given spacing and origin.
    pub fn axis_aligned(spacing: Vector3<f64>, origin: Vector3<f64>) -> Result<Self, GeometryError> {
        Self::new(spacing, origin, Matrix3::identity())
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        for axis in 0..3 {
            let value = self.spacing[axis];
            if !(value > 0.0) || !value.is_finite() {
                return Err(GeometryError::NonPositiveSpacing { axis, value });
            }
        }
        if !is_orthonormal(&self.direction, ORTHONORMAL_TOLERANCE) {
            return Err(GeometryError::NonOrthonormalDirection);
        }
        if self.origin.iter().any(|v| !v.is_finite()) {
            return Err(GeometryError::NonInvertibleTransform);
        }
        Ok(())
    }

    pub fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    pub fn origin(&self) -> &Vector3<f64> {
        &self.origin
    }

    pub fn direction(&self) -> &Matrix3<f64> {
        &self.direction
    }

    /// Continuous grid index `(x, y, z)` to physical position.
    #[inline]
    pub fn index_to_physical(&self, index: &Vector3<f64>) -> Vector3<f64> {
        self.origin + self.direction * index.component_mul(&self.spacing)
    }

    /// Physical position to continuous grid index `(x, y, z)`.
    #[inline]
    pub fn physical_to_index(&self, point: &Vector3<f64>) -> Vector3<f64> {
        (self.direction.transpose() * (point - self.origin)).component_div(&self.spacing)
    }

    /// Whether every column of the direction matrix is (within `tolerance`)
    /// a signed unit axis.
    pub fn is_signed_permutation(&self, tolerance: f64) -> bool {
        self.direction.column_iter().all(|column| {
            let largest = column.amax();
            (largest - 1.0).abs() <= tolerance
        })
    }
}

/// Columns unit length and mutually perpendicular.
pub fn is_orthonormal(direction: &Matrix3<f64>, tolerance: f64) -> bool {
    if direction.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let gram = direction.transpose() * direction;
    (gram - Matrix3::identity()).amax() <= tolerance
}

/// Calibrated 3D scalar grid. Data is indexed `[z, y, x]`.
#[derive(Clone, Debug)]
pub struct Volume {
    data: Array3<f32>,
    geometry: Geometry,
}

impl Volume {
    pub fn new(data: Array3<f32>, geometry: Geometry) -> Result<Self, GeometryError> {
        geometry.validate()?;
        if data.is_empty() {
            return Err(GeometryError::InconsistentDimensions);
        }
        Ok(Self { data, geometry })
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Grid size along `(x, y, z)`.
    pub fn size(&self) -> Vector3<usize> {
        let (depth, height, width) = self.dim();
        Vector3::new(width, height, depth)
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn into_parts(self) -> (Array3<f32>, Geometry) {
        (self.data, self.geometry)
    }

    /// Physical size along each grid axis, in mm.
    pub fn extent(&self) -> Vector3<f64> {
        self.size().map(|n| n as f64).component_mul(self.geometry.spacing())
    }

    /// Physical position of the grid centre.
    pub fn center(&self) -> Vector3<f64> {
        let half = self.size().map(|n| (n as f64 - 1.0) / 2.0);
        self.geometry.index_to_physical(&half)
    }

    /// Value at a physical position, `None` outside the grid.
    pub fn sample(&self, point: &Vector3<f64>, interpolation: Interpolation) -> Option<f32> {
        let index = self.geometry.physical_to_index(point);
        Interpolator::sample(&self.data.view(), &index, interpolation)
    }

    /// Minimum and maximum voxel value.
    pub fn value_range(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }
}

/// Binary label grid sharing the geometry of the volume it was derived from.
#[derive(Clone, Debug)]
pub struct Mask {
    data: Array3<bool>,
    geometry: Geometry,
    tissue: Tissue,
}

impl Mask {
    pub fn new(data: Array3<bool>, geometry: Geometry, tissue: Tissue) -> Self {
        Self {
            data,
            geometry,
            tissue,
        }
    }

    pub fn data(&self) -> &Array3<bool> {
        &self.data
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn tissue(&self) -> Tissue {
        self.tissue
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&v| v)
    }
}
