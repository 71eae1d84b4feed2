use std::fmt;

/// Container format of an uploaded scan, derived from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFormat {
    Dicom,
    Nifti,
}

impl fmt::Display for ScanFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanFormat::Dicom => f.write_str("dicom"),
            ScanFormat::Nifti => f.write_str("nifti"),
        }
    }
}

/// Decoded voxel samples, tagged by their storage width.
///
/// Samples are stored with x varying fastest, then y, then z.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    U8(Vec<u8>),
    I16(Vec<i16>),
    F32(Vec<f32>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::U8(values) => values.len(),
            Samples::I16(values) => values.len(),
            Samples::F32(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of one sample in bytes.
    pub fn width(&self) -> usize {
        match self {
            Samples::U8(_) => 1,
            Samples::I16(_) => 2,
            Samples::F32(_) => 4,
        }
    }

    /// Returns the sample at `index` widened to `f64`.
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn value_at(&self, index: usize) -> f64 {
        match self {
            Samples::U8(values) => f64::from(values[index]),
            Samples::I16(values) => f64::from(values[index]),
            Samples::F32(values) => f64::from(values[index]),
        }
    }
}
