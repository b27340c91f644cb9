use crate::error::GeometryError;
use nalgebra::Vector3;
use ndarray::Array2;

/// Below this cross-product magnitude the two orientation vectors are
/// treated as parallel.
const DEGENERATE_NORMAL_EPSILON: f64 = 1e-6;

/// One 2D image plane with its acquisition metadata.
///
/// Every metadata field is optional: a tag missing from the source file is
/// `None` here, never a default value. A `Slice` has no mutators; the
/// `with_*` methods consume it and are meant for building one up.
#[derive(Clone, Debug)]
pub struct Slice {
    pixels: Array2<f32>,
    pixel_spacing: Option<(f64, f64)>,
    position: Option<Vector3<f64>>,
    orientation: Option<(Vector3<f64>, Vector3<f64>)>,
    series_uid: Option<String>,
    frame_of_reference_uid: Option<String>,
    acquisition_index: Option<i32>,
}

impl Slice {
    pub fn new(pixels: Array2<f32>) -> Self {
        Self {
            pixels,
            pixel_spacing: None,
            position: None,
            orientation: None,
            series_uid: None,
            frame_of_reference_uid: None,
            acquisition_index: None,
        }
    }

    /// `(row spacing, column spacing)` in mm, as in DICOM `PixelSpacing`.
    pub fn with_pixel_spacing(mut self, row_spacing: f64, column_spacing: f64) -> Self {
        self.pixel_spacing = Some((row_spacing, column_spacing));
        self
    }

    pub fn with_position(mut self, position: Vector3<f64>) -> Self {
        self.position = Some(position);
        self
    }

    /// `row` points along increasing column index, `column` along increasing
    /// row index (DICOM `ImageOrientationPatient` order).
    pub fn with_orientation(mut self, row: Vector3<f64>, column: Vector3<f64>) -> Self {
        self.orientation = Some((row, column));
        self
    }

    pub fn with_series_uid(mut self, uid: impl Into<String>) -> Self {
        self.series_uid = Some(uid.into());
        self
    }

    pub fn with_frame_of_reference(mut self, uid: impl Into<String>) -> Self {
        self.frame_of_reference_uid = Some(uid.into());
        self
    }

    pub fn with_acquisition_index(mut self, index: i32) -> Self {
        self.acquisition_index = Some(index);
        self
    }

    pub fn pixels(&self) -> &Array2<f32> {
        &self.pixels
    }

    /// `(rows, columns)`
    pub fn dim(&self) -> (usize, usize) {
        self.pixels.dim()
    }

    pub fn pixel_spacing(&self) -> Option<(f64, f64)> {
        self.pixel_spacing
    }

    pub fn position(&self) -> Option<&Vector3<f64>> {
        self.position.as_ref()
    }

    pub fn orientation(&self) -> Option<&(Vector3<f64>, Vector3<f64>)> {
        self.orientation.as_ref()
    }

    pub fn series_uid(&self) -> Option<&str> {
        self.series_uid.as_deref()
    }

    pub fn frame_of_reference_uid(&self) -> Option<&str> {
        self.frame_of_reference_uid.as_deref()
    }

    pub fn acquisition_index(&self) -> Option<i32> {
        self.acquisition_index
    }

    /// Unit plane normal, `row × column`.
    ///
    /// Returns `Ok(None)` when the slice carries no orientation.
    pub fn normal(&self) -> Result<Option<Vector3<f64>>, GeometryError> {
        let Some((row, column)) = &self.orientation else {
            return Ok(None);
        };
        let cross = row.cross(column);
        let norm = cross.norm();
        if norm < DEGENERATE_NORMAL_EPSILON || !norm.is_finite() {
            return Err(GeometryError::DegenerateOrientation);
        }
        Ok(Some(cross / norm))
    }

    /// Short human-readable name used in warnings.
    pub fn label(&self) -> String {
        match (self.series_uid(), self.acquisition_index) {
            (Some(series), Some(index)) => format!("{series}#{index}"),
            (None, Some(index)) => format!("#{index}"),
            (Some(series), None) => format!("{series}#?"),
            (None, None) => "unnamed slice".to_string(),
        }
    }
}
