use crate::enums::ScanFormat;

use thiserror::Error;

/// Accepted file name suffixes, compared case-insensitively.
pub const ALLOWED_EXTENSIONS: [&str; 4] = [".dcm", ".dicom", ".nii", ".nii.gz"];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("unsupported file type {0:?}, expected .dcm, .dicom, .nii or .nii.gz")]
    UnsupportedExtension(String),

    #[error("background load failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Metadata recorded for every accepted upload, whether or not it parses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MedicalFileInfo {
    pub file_name: String,
    pub extension: String,
    pub size_bytes: usize,
    pub format: ScanFormat,
}

impl MedicalFileInfo {
    /// Validate the file name and record its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::UnsupportedExtension`] when the name does not
    /// end in one of [`ALLOWED_EXTENSIONS`].
    pub fn from_name(file_name: &str, size_bytes: usize) -> Result<Self, UploadError> {
        if !is_supported_medical_file(file_name) {
            return Err(UploadError::UnsupportedExtension(file_name.to_owned()));
        }

        Ok(Self {
            file_name: file_name.to_owned(),
            extension: extension_of(file_name),
            size_bytes,
            format: detect_format(file_name),
        })
    }
}

pub fn is_supported_medical_file(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

pub fn detect_format(file_name: &str) -> ScanFormat {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".nii") || lower.ends_with(".nii.gz") {
        ScanFormat::Nifti
    } else {
        ScanFormat::Dicom
    }
}

fn extension_of(file_name: &str) -> String {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".nii.gz") {
        return ".nii.gz".to_owned();
    }
    lower
        .rfind('.')
        .map(|dot| lower[dot..].to_owned())
        .unwrap_or_default()
}
