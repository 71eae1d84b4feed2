use crate::enums::{Samples, ScanFormat};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use dicom::{
    core::Tag,
    object::{DefaultDicomObject, from_reader},
};
use dicom_dictionary_std::tags;
use flate2::read::MultiGzDecoder;
use log::debug;
use nifti::{Endianness, NiftiHeader, NiftiType};
use std::io::{Cursor, Read};
use thiserror::Error;

const DEFAULT_ROWS: u32 = 256;
const DEFAULT_COLUMNS: u32 = 256;
const DEFAULT_FRAMES: u32 = 1;
const DEFAULT_BITS_ALLOCATED: u32 = 16;

const DICOM_PREAMBLE_LEN: usize = 128;
const DICOM_MAGIC: &[u8; 4] = b"DICM";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// Header plus the 4-byte extension flag of a single-file image.
const NIFTI1_MIN_VOX_OFFSET: usize = 352;
const NIFTI1_MAGIC_SINGLE: &[u8; 4] = b"n+1\0";
const NIFTI1_MAGIC_PAIR: &[u8; 4] = b"ni1\0";

/// Upper bound on an inflated `.nii.gz`, well above any scan that still
/// fits the volume budget after downsampling.
const MAX_INFLATED_BYTES: u64 = 1 << 31;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("pixel data element is missing or malformed")]
    MissingPixelData,

    #[error("failed to decompress gzip stream: {0}")]
    Decompression(#[from] std::io::Error),

    #[error("image payload truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid volume dimensions {0:?}")]
    InvalidDimensions((usize, usize, usize)),

    #[error("gzip stream inflates past {limit} bytes")]
    InflatedTooLarge { limit: u64 },
}

/// A decoded scan: raw samples on a regular grid, x varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelGrid {
    samples: Samples,
    dims: (usize, usize, usize),
    spacing: Option<(f32, f32, f32)>,
}

impl VoxelGrid {
    /// # Errors
    ///
    /// Fails if any dimension is zero or the sample count does not match
    /// `nx * ny * nz`.
    pub fn new(
        samples: Samples,
        dims: (usize, usize, usize),
        spacing: Option<(f32, f32, f32)>,
    ) -> Result<Self, ParseError> {
        let (nx, ny, nz) = dims;
        let total = voxel_count(dims).ok_or(ParseError::InvalidDimensions(dims))?;
        if nx == 0 || ny == 0 || nz == 0 || samples.len() != total {
            return Err(ParseError::InvalidDimensions(dims));
        }
        Ok(Self {
            samples,
            dims,
            spacing,
        })
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    /// Grid dimensions as (nx, ny, nz).
    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    /// Physical voxel size along (x, y, z), when the source recorded one.
    pub fn spacing(&self) -> Option<(f32, f32, f32)> {
        self.spacing
    }
}

pub struct ScanReader;

impl ScanReader {
    /// Decode a DICOM or NIfTI byte buffer into a voxel grid.
    ///
    /// No orientation, affine or rescale correction is applied; the payload
    /// is returned as stored.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] for anything that cannot be turned into a
    /// grid. Callers are expected to treat that as "no volume available".
    pub fn parse(bytes: &[u8], format: ScanFormat) -> Result<VoxelGrid, ParseError> {
        let grid = match format {
            ScanFormat::Nifti => Self::read_nifti(bytes)?,
            ScanFormat::Dicom => Self::read_dicom(bytes)?,
        };
        debug!(
            "parsed {format} scan: dims {:?}, {}-byte samples",
            grid.dims(),
            grid.samples().width()
        );
        Ok(grid)
    }

    fn read_nifti(bytes: &[u8]) -> Result<VoxelGrid, ParseError> {
        if bytes.starts_with(&GZIP_MAGIC) {
            let inflated = Self::gunzip(bytes, MAX_INFLATED_BYTES)?;
            return Self::read_nifti_image(&inflated);
        }
        Self::read_nifti_image(bytes)
    }

    fn gunzip(bytes: &[u8], limit: u64) -> Result<Vec<u8>, ParseError> {
        let mut inflated = Vec::with_capacity(bytes.len().saturating_mul(4));
        // One byte past the limit is enough to tell an oversized stream apart.
        MultiGzDecoder::new(bytes)
            .take(limit.saturating_add(1))
            .read_to_end(&mut inflated)?;
        if inflated.len() as u64 > limit {
            return Err(ParseError::InflatedTooLarge { limit });
        }
        debug!("inflated {} gzip bytes to {}", bytes.len(), inflated.len());
        Ok(inflated)
    }

    fn read_nifti_image(bytes: &[u8]) -> Result<VoxelGrid, ParseError> {
        let header = NiftiHeader::from_reader(Cursor::new(bytes))
            .map_err(|e| ParseError::UnsupportedFormat(format!("NIfTI header: {e}")))?;

        if &header.magic == NIFTI1_MAGIC_PAIR {
            return Err(ParseError::UnsupportedFormat(
                "detached .hdr/.img pairs are not supported".to_owned(),
            ));
        }
        if &header.magic != NIFTI1_MAGIC_SINGLE {
            return Err(ParseError::UnsupportedFormat(format!(
                "bad NIfTI magic {:?}",
                String::from_utf8_lossy(&header.magic)
            )));
        }

        let rank = usize::from(header.dim[0]).min(7);
        let axis = |i: usize| -> usize {
            if i <= rank {
                usize::from(header.dim[i]).max(1)
            } else {
                1
            }
        };
        let dims = (axis(1), axis(2), axis(3));

        let pixdim = header.pixdim;
        let spacing = (pixdim[1] > 0.0 && pixdim[2] > 0.0 && pixdim[3] > 0.0)
            .then_some((pixdim[1], pixdim[2], pixdim[3]));

        let data_type = header.data_type().map_err(|_| {
            ParseError::UnsupportedFormat(format!("NIfTI datatype {}", header.datatype))
        })?;
        let width = Self::nifti_sample_width(data_type)?;

        let offset = if header.vox_offset.is_finite() && header.vox_offset > 0.0 {
            (header.vox_offset as usize).max(NIFTI1_MIN_VOX_OFFSET)
        } else {
            NIFTI1_MIN_VOX_OFFSET
        };
        let count = voxel_count(dims).ok_or(ParseError::InvalidDimensions(dims))?;
        let payload = bytes.get(offset..).unwrap_or_default();
        let expected = count
            .checked_mul(width)
            .ok_or(ParseError::InvalidDimensions(dims))?;
        if payload.len() < expected {
            return Err(ParseError::Truncated {
                expected,
                actual: payload.len(),
            });
        }
        // Only the first volume of a time series is kept.
        let payload = &payload[..expected];

        let samples = match header.endianness {
            Endianness::Little => Self::nifti_samples::<LittleEndian>(data_type, payload, count),
            Endianness::Big => Self::nifti_samples::<BigEndian>(data_type, payload, count),
        }?;
        VoxelGrid::new(samples, dims, spacing)
    }

    fn nifti_samples<E: ByteOrder>(
        data_type: NiftiType,
        payload: &[u8],
        count: usize,
    ) -> Result<Samples, ParseError> {
        let samples = match data_type {
            NiftiType::Uint8 => Samples::U8(payload.to_vec()),
            NiftiType::Int16 => {
                let mut values = vec![0_i16; count];
                E::read_i16_into(payload, &mut values);
                Samples::I16(values)
            }
            NiftiType::Float32 => {
                let mut values = vec![0_f32; count];
                E::read_f32_into(payload, &mut values);
                Samples::F32(values)
            }
            NiftiType::Int8 => Samples::F32(payload.iter().map(|&b| f32::from(b as i8)).collect()),
            NiftiType::Uint16 => {
                let mut values = vec![0_u16; count];
                E::read_u16_into(payload, &mut values);
                Samples::F32(values.into_iter().map(f32::from).collect())
            }
            NiftiType::Int32 => {
                let mut values = vec![0_i32; count];
                E::read_i32_into(payload, &mut values);
                Samples::F32(values.into_iter().map(|v| v as f32).collect())
            }
            NiftiType::Uint32 => {
                let mut values = vec![0_u32; count];
                E::read_u32_into(payload, &mut values);
                Samples::F32(values.into_iter().map(|v| v as f32).collect())
            }
            NiftiType::Float64 => {
                let mut values = vec![0_f64; count];
                E::read_f64_into(payload, &mut values);
                Samples::F32(values.into_iter().map(|v| v as f32).collect())
            }
            other => {
                return Err(ParseError::UnsupportedFormat(format!(
                    "NIfTI datatype {other:?}"
                )));
            }
        };
        Ok(samples)
    }

    fn nifti_sample_width(data_type: NiftiType) -> Result<usize, ParseError> {
        match data_type {
            NiftiType::Uint8 | NiftiType::Int8 => Ok(1),
            NiftiType::Int16 | NiftiType::Uint16 => Ok(2),
            NiftiType::Int32 | NiftiType::Uint32 | NiftiType::Float32 => Ok(4),
            NiftiType::Float64 => Ok(8),
            other => Err(ParseError::UnsupportedFormat(format!(
                "NIfTI datatype {other:?}"
            ))),
        }
    }

    fn read_dicom(bytes: &[u8]) -> Result<VoxelGrid, ParseError> {
        let stream = Self::strip_preamble(bytes);
        let dicom_object =
            from_reader(stream).map_err(|e| ParseError::UnsupportedFormat(e.to_string()))?;

        let rows = Self::read_uint(&dicom_object, tags::ROWS).unwrap_or(DEFAULT_ROWS);
        let columns = Self::read_uint(&dicom_object, tags::COLUMNS).unwrap_or(DEFAULT_COLUMNS);
        let frames =
            Self::read_uint(&dicom_object, tags::NUMBER_OF_FRAMES).unwrap_or(DEFAULT_FRAMES);
        let bits_allocated = Self::read_uint(&dicom_object, tags::BITS_ALLOCATED)
            .unwrap_or(DEFAULT_BITS_ALLOCATED);

        let dims = (
            columns.max(1) as usize,
            rows.max(1) as usize,
            frames.max(1) as usize,
        );
        let count = voxel_count(dims).ok_or(ParseError::InvalidDimensions(dims))?;

        let pixel_data = dicom_object
            .element(tags::PIXEL_DATA)
            .map_err(|_| ParseError::MissingPixelData)?
            .to_bytes()
            .map_err(|_| ParseError::MissingPixelData)?;

        let samples = if bits_allocated == 16 {
            let expected = count
                .checked_mul(2)
                .ok_or(ParseError::InvalidDimensions(dims))?;
            if pixel_data.len() < expected {
                return Err(ParseError::MissingPixelData);
            }
            Samples::I16(
                pixel_data
                    .chunks_exact(2)
                    .take(count)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                    .collect(),
            )
        } else {
            if pixel_data.len() < count {
                return Err(ParseError::MissingPixelData);
            }
            Samples::U8(pixel_data[..count].to_vec())
        };

        VoxelGrid::new(samples, dims, Self::get_spacing(&dicom_object))
    }

    fn strip_preamble(bytes: &[u8]) -> &[u8] {
        match bytes.get(DICOM_PREAMBLE_LEN..DICOM_PREAMBLE_LEN + DICOM_MAGIC.len()) {
            Some(magic) if magic == DICOM_MAGIC => &bytes[DICOM_PREAMBLE_LEN..],
            _ => bytes,
        }
    }

    fn read_uint(dicom_object: &DefaultDicomObject, tag: Tag) -> Option<u32> {
        dicom_object.element(tag).ok()?.to_int::<u32>().ok()
    }

    fn get_spacing(dicom_object: &DefaultDicomObject) -> Option<(f32, f32, f32)> {
        // PixelSpacing is (row spacing, column spacing).
        let pixel_spacing = dicom_object
            .element(tags::PIXEL_SPACING)
            .ok()?
            .to_multi_float32()
            .ok()?;
        let slice_thickness = dicom_object
            .element(tags::SLICE_THICKNESS)
            .ok()?
            .to_float32()
            .ok()?;

        match pixel_spacing.as_slice() {
            [row, column, ..] => Some((*column, *row, slice_thickness)),
            _ => None,
        }
    }
}

fn voxel_count((nx, ny, nz): (usize, usize, usize)) -> Option<usize> {
    nx.checked_mul(ny)?.checked_mul(nz)
}

#[cfg(test)]
mod tests {
    use super::*;

    use dicom::{
        core::{DataElement, PrimitiveValue, VR},
        object::{FileMetaTableBuilder, InMemDicomObject},
    };
    use dicom_dictionary_std::uids;
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    mod datatype {
        pub const UINT8: i16 = 2;
        pub const INT16: i16 = 4;
        pub const FLOAT32: i16 = 16;
    }

    fn nifti_bytes(dims: [i16; 3], datatype: i16, bitpix: i16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0_u8; NIFTI1_MIN_VOX_OFFSET];
        LittleEndian::write_i32(&mut bytes[0..4], 348);
        let dim = [3, dims[0], dims[1], dims[2], 1, 1, 1, 1];
        LittleEndian::write_i16_into(&dim, &mut bytes[40..56]);
        LittleEndian::write_i16(&mut bytes[70..72], datatype);
        LittleEndian::write_i16(&mut bytes[72..74], bitpix);
        let pixdim = [1.0_f32, 0.5, 0.75, 2.0, 0.0, 0.0, 0.0, 0.0];
        LittleEndian::write_f32_into(&pixdim, &mut bytes[76..108]);
        LittleEndian::write_f32(&mut bytes[108..112], 352.0);
        bytes[344..348].copy_from_slice(NIFTI1_MAGIC_SINGLE);
        bytes.extend_from_slice(payload);
        bytes
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn dicom_bytes(elements: Vec<DataElement<InMemDicomObject>>) -> Vec<u8> {
        let object = InMemDicomObject::from_element_iter(elements);
        let file = object
            .with_meta(
                FileMetaTableBuilder::new()
                    .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid("1.2.3.4.5")
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN),
            )
            .unwrap();
        let mut bytes = Vec::new();
        file.write_all(&mut bytes).unwrap();
        bytes
    }

    fn image_elements(rows: u16, columns: u16, bits: u16) -> Vec<DataElement<InMemDicomObject>> {
        vec![
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns)),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(bits)),
        ]
    }

    #[test]
    fn reads_uint8_nifti() {
        let payload: Vec<u8> = (0..24).collect();
        let bytes = nifti_bytes([2, 3, 4], datatype::UINT8, 8, &payload);
        let grid = ScanReader::parse(&bytes, ScanFormat::Nifti).unwrap();
        assert_eq!(grid.dims(), (2, 3, 4));
        assert_eq!(grid.samples(), &Samples::U8(payload));
        assert_eq!(grid.spacing(), Some((0.5, 0.75, 2.0)));
    }

    #[test]
    fn reads_gzipped_int16_nifti() {
        let values: [i16; 4] = [-100, 0, 7, 3000];
        let mut payload = vec![0_u8; 8];
        LittleEndian::write_i16_into(&values, &mut payload);
        let bytes = gzip(&nifti_bytes([2, 2, 1], datatype::INT16, 16, &payload));

        let grid = ScanReader::parse(&bytes, ScanFormat::Nifti).unwrap();
        assert_eq!(grid.dims(), (2, 2, 1));
        assert_eq!(grid.samples(), &Samples::I16(values.to_vec()));
    }

    #[test]
    fn reads_big_endian_float_nifti() {
        let mut bytes = vec![0_u8; NIFTI1_MIN_VOX_OFFSET];
        BigEndian::write_i32(&mut bytes[0..4], 348);
        BigEndian::write_i16_into(&[3, 2, 1, 1, 1, 1, 1, 1], &mut bytes[40..56]);
        BigEndian::write_i16(&mut bytes[70..72], datatype::FLOAT32);
        BigEndian::write_f32(&mut bytes[108..112], 352.0);
        bytes[344..348].copy_from_slice(NIFTI1_MAGIC_SINGLE);
        let mut payload = vec![0_u8; 8];
        BigEndian::write_f32_into(&[1.5, -2.25], &mut payload);
        bytes.extend_from_slice(&payload);

        let grid = ScanReader::parse(&bytes, ScanFormat::Nifti).unwrap();
        assert_eq!(grid.dims(), (2, 1, 1));
        assert_eq!(grid.samples(), &Samples::F32(vec![1.5, -2.25]));
        assert_eq!(grid.spacing(), None);
    }

    #[test]
    fn missing_nifti_axes_floor_at_one() {
        let mut bytes = nifti_bytes([4, 0, 0], datatype::UINT8, 8, &[1, 2, 3, 4]);
        LittleEndian::write_i16(&mut bytes[40..42], 1);
        let grid = ScanReader::parse(&bytes, ScanFormat::Nifti).unwrap();
        assert_eq!(grid.dims(), (4, 1, 1));
    }

    #[test]
    fn keeps_first_volume_of_time_series() {
        let payload: Vec<u8> = (0..16).collect();
        let mut bytes = nifti_bytes([2, 2, 2], datatype::UINT8, 8, &payload);
        LittleEndian::write_i16_into(&[4, 2, 2, 2, 2], &mut bytes[40..50]);
        let grid = ScanReader::parse(&bytes, ScanFormat::Nifti).unwrap();
        assert_eq!(grid.samples(), &Samples::U8(payload[..8].to_vec()));
    }

    #[test]
    fn rejects_bad_nifti_magic() {
        let mut bytes = nifti_bytes([1, 1, 1], datatype::UINT8, 8, &[0]);
        bytes[344..348].copy_from_slice(b"xyz\0");
        let err = ScanReader::parse(&bytes, ScanFormat::Nifti).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedFormat(_)));
    }

    #[test]
    fn rejects_short_nifti_header() {
        let err = ScanReader::parse(&[0_u8; 100], ScanFormat::Nifti).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedFormat(_)));
    }

    #[test]
    fn reports_truncated_nifti_payload() {
        let bytes = nifti_bytes([4, 4, 4], datatype::INT16, 16, &[0; 10]);
        let err = ScanReader::parse(&bytes, ScanFormat::Nifti).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Truncated {
                expected: 128,
                actual: 10
            }
        ));
    }

    #[test]
    fn corrupt_gzip_is_a_decompression_failure() {
        let bytes = [0x1f, 0x8b, 0x08, 0x00, 0xff, 0xff];
        let err = ScanReader::parse(&bytes, ScanFormat::Nifti).unwrap_err();
        assert!(matches!(err, ParseError::Decompression(_)));
    }

    #[test]
    fn inflating_past_the_limit_is_refused() {
        let bytes = gzip(&[0_u8; 4096]);
        let err = ScanReader::gunzip(&bytes, 1024).unwrap_err();
        assert!(matches!(err, ParseError::InflatedTooLarge { limit: 1024 }));
        assert_eq!(ScanReader::gunzip(&bytes, 4096).unwrap().len(), 4096);
    }

    #[test]
    fn detached_nifti_pair_is_refused() {
        let mut bytes = nifti_bytes([1, 1, 1], datatype::UINT8, 8, &[0]);
        bytes[344..348].copy_from_slice(NIFTI1_MAGIC_PAIR);
        let err = ScanReader::parse(&bytes, ScanFormat::Nifti).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedFormat(msg) if msg.contains("pairs")));
    }

    #[test]
    fn unsupported_nifti_datatype_is_reported() {
        // 32 is complex64.
        let bytes = nifti_bytes([1, 1, 1], 32, 64, &[0; 8]);
        let err = ScanReader::parse(&bytes, ScanFormat::Nifti).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedFormat(_)));
    }

    #[test]
    fn reads_16_bit_dicom() {
        let values: [i16; 6] = [-5, 0, 1, 2, 3, 1000];
        let pixel_bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut elements = image_elements(2, 3, 16);
        elements.push(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::U8(pixel_bytes.into()),
        ));

        let grid = ScanReader::parse(&dicom_bytes(elements), ScanFormat::Dicom).unwrap();
        assert_eq!(grid.dims(), (3, 2, 1));
        assert_eq!(grid.samples(), &Samples::I16(values.to_vec()));
    }

    #[test]
    fn reads_8_bit_multiframe_dicom() {
        let mut elements = image_elements(2, 2, 8);
        elements.push(DataElement::new(
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            PrimitiveValue::from("2"),
        ));
        elements.push(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::U8((0..8_u8).collect::<Vec<_>>().into()),
        ));

        let grid = ScanReader::parse(&dicom_bytes(elements), ScanFormat::Dicom).unwrap();
        assert_eq!(grid.dims(), (2, 2, 2));
        assert_eq!(grid.samples(), &Samples::U8((0..8).collect()));
    }

    #[test]
    fn dicom_without_pixel_data_is_reported() {
        let bytes = dicom_bytes(image_elements(2, 2, 8));
        let err = ScanReader::parse(&bytes, ScanFormat::Dicom).unwrap_err();
        assert!(matches!(err, ParseError::MissingPixelData));
    }

    #[test]
    fn short_dicom_pixel_data_is_reported() {
        let mut elements = image_elements(4, 4, 16);
        elements.push(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::U8(vec![0_u8; 4].into()),
        ));
        let err = ScanReader::parse(&dicom_bytes(elements), ScanFormat::Dicom).unwrap_err();
        assert!(matches!(err, ParseError::MissingPixelData));
    }

    #[test]
    fn huge_16_bit_dicom_dimensions_do_not_overflow() {
        let mut elements = image_elements(u16::MAX, u16::MAX, 16);
        elements.push(DataElement::new(
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            PrimitiveValue::from(u32::MAX.to_string()),
        ));
        elements.push(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::U8(vec![0_u8; 4].into()),
        ));
        let err = ScanReader::parse(&dicom_bytes(elements), ScanFormat::Dicom).unwrap_err();
        assert!(matches!(err, ParseError::InvalidDimensions(_)));
    }

    #[test]
    fn garbage_is_not_dicom() {
        let err = ScanReader::parse(b"definitely not a dicom file", ScanFormat::Dicom)
            .unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedFormat(_)));
    }

    #[test]
    fn grid_rejects_mismatched_sample_count() {
        let err = VoxelGrid::new(Samples::U8(vec![0; 5]), (2, 2, 1), None).unwrap_err();
        assert!(matches!(err, ParseError::InvalidDimensions((2, 2, 1))));
        assert!(VoxelGrid::new(Samples::U8(vec![]), (0, 1, 1), None).is_err());
    }
}
