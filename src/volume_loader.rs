use crate::slice::Slice;

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use nalgebra::Vector3;
use ndarray::{Array2, s};
use rayon::prelude::*;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::{debug, warn};

/// `ImageType` values marking planning images that are never part of a stack.
const EXCLUDED_IMAGE_TYPES: [&str; 2] = ["LOCALIZER", "SCOUT"];

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Read DICOM objects into slice records
    ///
    /// # Arguments
    ///
    /// * `dicom_objects` - Slice of DICOM file objects
    ///
    /// # Errors
    ///
    /// Returns error if no object yields a decodable, non-localizer image
    pub fn load_slices_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Result<Vec<Slice>, VolumeLoaderError> {
        let slices: Vec<Slice> = dicom_objects
            .par_iter()
            .filter_map(Self::extract_slice)
            .collect();

        if slices.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        debug!(
            read = slices.len(),
            skipped = dicom_objects.len() - slices.len(),
            "Read DICOM slices"
        );
        Ok(slices)
    }

    /// Read slice records from file paths
    ///
    /// Files that cannot be parsed as DICOM are skipped with a warning.
    pub fn load_slices_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
    ) -> Result<Vec<Slice>, VolumeLoaderError> {
        let objects: Vec<_> = paths
            .par_iter()
            .filter_map(|path| match open_file(path.as_ref()) {
                Ok(object) => Some(object),
                Err(e) => {
                    warn!(path = %path.as_ref().display(), error = %e, "Skipping unreadable file");
                    None
                }
            })
            .collect();

        if objects.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        Self::load_slices_from_dicom_objects(&objects)
    }

    /// Read slice records from a directory containing .dcm files
    pub fn load_slices_from_directory(
        path: impl AsRef<Path>,
    ) -> Result<Vec<Slice>, VolumeLoaderError> {
        let mut paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        // directory order is platform dependent
        paths.sort();

        Self::load_slices_from_file_paths(&paths)
    }

    fn extract_slice(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Slice> {
        if Self::is_excluded(dicom_object) {
            debug!("Skipping localizer image");
            return None;
        }

        let Some(pixels) = Self::decode_image(dicom_object) else {
            let series = Self::get_string(dicom_object, tags::SERIES_INSTANCE_UID);
            warn!(
                series = series.as_deref(),
                "Skipping object with undecodable pixel data"
            );
            return None;
        };

        let mut slice = Slice::new(pixels);
        if let Some((row, column)) = Self::get_pixel_spacing(dicom_object) {
            slice = slice.with_pixel_spacing(row, column);
        }
        if let Some(position) = Self::get_position(dicom_object) {
            slice = slice.with_position(position);
        }
        if let Some((row, column)) = Self::get_orientation(dicom_object) {
            slice = slice.with_orientation(row, column);
        }
        if let Some(uid) = Self::get_string(dicom_object, tags::SERIES_INSTANCE_UID) {
            slice = slice.with_series_uid(uid);
        }
        if let Some(uid) = Self::get_string(dicom_object, tags::FRAME_OF_REFERENCE_UID) {
            slice = slice.with_frame_of_reference(uid);
        }
        if let Some(number) = dicom_object
            .element(tags::INSTANCE_NUMBER)
            .ok()
            .and_then(|e| e.to_int::<i32>().ok())
        {
            slice = slice.with_acquisition_index(number);
        }
        Some(slice)
    }

    fn is_excluded(dicom_object: &FileDicomObject<InMemDicomObject>) -> bool {
        dicom_object
            .element(tags::IMAGE_TYPE)
            .ok()
            .and_then(|e| e.to_multi_str().ok())
            .is_some_and(|values| {
                values.iter().any(|value| {
                    let value = value.trim().to_ascii_uppercase();
                    EXCLUDED_IMAGE_TYPES.contains(&value.as_str())
                })
            })
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        // modality rescale only; windowing would clip the signal range
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn get_pixel_spacing(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<(f64, f64)> {
        let spacing = dicom_object
            .element(tags::PIXEL_SPACING)
            .ok()?
            .to_multi_float64()
            .ok()?;
        match spacing.as_slice() {
            [row, column, ..] => Some((*row, *column)),
            _ => None,
        }
    }

    fn get_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Vector3<f64>> {
        let position = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float64()
            .ok()?;
        match position.as_slice() {
            [x, y, z, ..] => Some(Vector3::new(*x, *y, *z)),
            _ => None,
        }
    }

    fn get_orientation(
        dicom_object: &FileDicomObject<InMemDicomObject>,
    ) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let values = dicom_object
            .element(tags::IMAGE_ORIENTATION_PATIENT)
            .ok()?
            .to_multi_float64()
            .ok()?;
        Self::split_orientation(&values)
    }

    fn split_orientation(values: &[f64]) -> Option<(Vector3<f64>, Vector3<f64>)> {
        match values {
            [rx, ry, rz, cx, cy, cz, ..] => Some((
                Vector3::new(*rx, *ry, *rz),
                Vector3::new(*cx, *cy, *cz),
            )),
            _ => None,
        }
    }

    fn get_string(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        tag: dicom::core::Tag,
    ) -> Option<String> {
        let value = dicom_object.element(tag).ok()?.to_str().ok()?;
        let trimmed = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}
