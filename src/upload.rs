use crate::format_reader::{ParseError, ScanReader};
use crate::medical_file::{MedicalFileInfo, UploadError};
use crate::volume::{VolumeData, normalize_and_downsample};

use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use web_time::Instant;

/// Result of accepting one upload.
///
/// A file with an allowed extension is always accepted. If its contents
/// cannot be decoded, `volume` is `None` and `warning` says why; the 3D view
/// then shows its placeholder instead of failing.
#[derive(Debug)]
pub struct UploadedScan {
    pub file: MedicalFileInfo,
    pub volume: Option<Arc<VolumeData>>,
    pub warning: Option<ParseError>,
}

/// Validate, decode and normalize an uploaded file.
///
/// # Errors
///
/// Only an unsupported extension is an error, and it is reported before any
/// byte is parsed.
pub fn load_medical_file(file_name: &str, bytes: &[u8]) -> Result<UploadedScan, UploadError> {
    let file = MedicalFileInfo::from_name(file_name, bytes.len())?;
    let start = Instant::now();

    let scan = match ScanReader::parse(bytes, file.format) {
        Ok(grid) => {
            let volume = normalize_and_downsample(&grid);
            info!(
                "loaded {} ({}): {:?} -> {:?} in {:?}",
                file.file_name,
                file.format,
                grid.dims(),
                volume.dims(),
                start.elapsed()
            );
            UploadedScan {
                file,
                volume: Some(Arc::new(volume)),
                warning: None,
            }
        }
        Err(error) => {
            warn!("could not read {}: {error}", file.file_name);
            UploadedScan {
                file,
                volume: None,
                warning: Some(error),
            }
        }
    };
    Ok(scan)
}

/// Ticket handed out by [`VolumeSlot::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LoadTicket(u64);

/// Holds the volume on display. Loads may finish out of order; only the
/// most recently started one is allowed to replace the contents.
#[derive(Debug, Default)]
pub struct VolumeSlot {
    latest: AtomicU64,
    current: RwLock<Option<Arc<VolumeData>>>,
}

impl VolumeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a load. Every earlier ticket becomes stale.
    pub fn begin(&self) -> LoadTicket {
        LoadTicket(self.latest.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Store `volume` if `ticket` is still the latest one issued. Returns
    /// whether the slot changed.
    pub fn commit(&self, ticket: LoadTicket, volume: Option<Arc<VolumeData>>) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if ticket.0 != self.latest.load(Ordering::Acquire) {
            return false;
        }
        *current = volume;
        true
    }

    pub fn current(&self) -> Option<Arc<VolumeData>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// What happened to a load started with [`load_into_slot`].
#[derive(Debug)]
pub struct SlotLoad {
    pub scan: UploadedScan,
    /// False when a newer load was started before this one finished.
    pub committed: bool,
}

/// Decode an upload on the blocking pool and publish it to `slot`.
///
/// A file that fails to parse still replaces the slot contents with `None`,
/// as long as no newer load has started.
///
/// # Errors
///
/// Fails on an unsupported extension, in which case the slot is untouched,
/// or when the worker task panics.
pub async fn load_into_slot(
    slot: Arc<VolumeSlot>,
    file_name: String,
    bytes: Vec<u8>,
) -> Result<SlotLoad, UploadError> {
    MedicalFileInfo::from_name(&file_name, bytes.len())?;
    let ticket = slot.begin();

    let scan =
        tokio::task::spawn_blocking(move || load_medical_file(&file_name, &bytes)).await??;
    let committed = slot.commit(ticket, scan.volume.clone());
    if !committed {
        info!("discarding stale load of {}", scan.file.file_name);
    }
    Ok(SlotLoad { scan, committed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};

    fn nifti_u8(dims: (i16, i16, i16), voxels: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0_u8; 352];
        LittleEndian::write_i32(&mut bytes[0..4], 348);
        LittleEndian::write_i16_into(&[3, dims.0, dims.1, dims.2, 1, 1, 1, 1], &mut bytes[40..56]);
        LittleEndian::write_i16(&mut bytes[70..72], 2);
        LittleEndian::write_i16(&mut bytes[72..74], 8);
        LittleEndian::write_f32_into(&[1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0], &mut bytes[76..108]);
        LittleEndian::write_f32(&mut bytes[108..112], 352.0);
        bytes[344..348].copy_from_slice(b"n+1\0");
        bytes.extend_from_slice(voxels);
        bytes
    }

    fn volume_of(value: u8) -> Arc<VolumeData> {
        let scan = load_medical_file("v.nii", &nifti_u8((2, 1, 1), &[0, value])).unwrap();
        scan.volume.unwrap()
    }

    #[test]
    fn valid_upload_produces_a_volume() {
        let voxels: Vec<u8> = (0..64).collect();
        let scan = load_medical_file("brain.nii", &nifti_u8((4, 4, 4), &voxels)).unwrap();
        assert!(scan.warning.is_none());
        assert_eq!(scan.file.size_bytes, 352 + 64);
        let volume = scan.volume.unwrap();
        assert_eq!(volume.dims(), (4, 4, 4));
        assert_eq!(volume.min_max(), (0.0, 63.0));
    }

    #[test]
    fn unreadable_upload_is_accepted_without_a_volume() {
        let scan = load_medical_file("broken.dcm", b"definitely not dicom").unwrap();
        assert_eq!(scan.file.file_name, "broken.dcm");
        assert!(scan.volume.is_none());
        assert!(scan.warning.is_some());
    }

    #[test]
    fn bad_extension_is_rejected() {
        assert!(matches!(
            load_medical_file("scan.png", &[]),
            Err(UploadError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn stale_commit_is_ignored() {
        let slot = VolumeSlot::new();
        let first = slot.begin();
        let second = slot.begin();

        assert!(slot.commit(second, Some(volume_of(2))));
        assert!(!slot.commit(first, Some(volume_of(1))));
        assert_eq!(slot.current().unwrap().data()[[0, 0, 1]], 1.0);
        assert_eq!(slot.current(), Some(volume_of(2)));
    }

    #[test]
    fn latest_commit_can_clear_the_slot() {
        let slot = VolumeSlot::new();
        let ticket = slot.begin();
        assert!(slot.commit(ticket, Some(volume_of(5))));
        let ticket = slot.begin();
        assert!(slot.commit(ticket, None));
        assert!(slot.current().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn load_into_slot_publishes_the_volume() {
        let slot = Arc::new(VolumeSlot::new());
        let load = load_into_slot(
            Arc::clone(&slot),
            "scan.nii".to_owned(),
            nifti_u8((2, 2, 2), &[0, 1, 2, 3, 4, 5, 6, 7]),
        )
        .await
        .unwrap();
        assert!(load.committed);
        assert_eq!(slot.current().unwrap().dims(), (2, 2, 2));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejected_extension_leaves_slot_untouched() {
        let slot = Arc::new(VolumeSlot::new());
        let ticket = slot.begin();
        assert!(slot.commit(ticket, Some(volume_of(3))));

        let result = load_into_slot(Arc::clone(&slot), "notes.txt".to_owned(), vec![1, 2, 3]).await;
        assert!(matches!(result, Err(UploadError::UnsupportedExtension(_))));
        assert!(slot.current().is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn newer_load_wins_over_older_one() {
        let slot = Arc::new(VolumeSlot::new());
        let stale = slot.begin();

        let load = load_into_slot(
            Arc::clone(&slot),
            "new.nii".to_owned(),
            nifti_u8((3, 1, 1), &[0, 1, 2]),
        )
        .await
        .unwrap();
        assert!(load.committed);

        // The older load finishes last but must not overwrite.
        assert!(!slot.commit(stale, Some(volume_of(9))));
        assert_eq!(slot.current().unwrap().dims(), (3, 1, 1));
    }
}
