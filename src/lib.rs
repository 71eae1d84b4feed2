//! # MIP-volume library
//!
//! This crate turns a single medical scan into a GPU ray-marched maximum
//! intensity projection.
//!
//! A scan is read from an in-memory DICOM (`.dcm`, `.dicom`) or NIfTI-1
//! (`.nii`, `.nii.gz`) buffer into a [`VoxelGrid`]. The grid is rescaled to
//! [0, 1] and, if needed, downsampled with nearest-neighbour resampling so
//! that it fits in [`MAX_VOLUME_SIZE`]³ voxels. Normalization and
//! resampling run in parallel using rayon.
//!
//! The resulting [`VolumeData`] is uploaded as a 3D texture and drawn with a
//! WGSL shader that marches every fragment of the volume's bounding box,
//! keeps the brightest sample and shades it with a headlight. The
//! [`raymarch`] module carries the same per-fragment math on the CPU.
//!
//! No orientation, affine or rescale correction is applied, and only the
//! first volume of a NIfTI time series is used. Multi-file DICOM series are
//! not assembled.
//!
//! # Examples
//!
//! ## Loading an upload
//!
//! ```no_run
//! # use mip_volume::load_medical_file;
//! let bytes = std::fs::read("brain.nii.gz").expect("should have read file");
//! let scan = load_medical_file("brain.nii.gz", &bytes).expect("should be a supported file");
//! match scan.volume {
//!     Some(volume) => println!("volume {:?}", volume.dims()),
//!     None => println!("no volume: {:?}", scan.warning),
//! }
//! ```
//!
//! ## Rendering offscreen
//!
//! ```no_run
//! # use mip_volume::{Camera, RayMarchSettings, RenderUniforms, VolumeRenderer, Window, load_medical_file};
//! # async fn render() -> Result<(), Box<dyn std::error::Error>> {
//! let bytes = std::fs::read("scan.dcm")?;
//! let volume = load_medical_file("scan.dcm", &bytes)?.volume.ok_or("unreadable")?;
//!
//! let mut renderer = VolumeRenderer::headless(&RayMarchSettings::default()).await?;
//! renderer.set_volume(&volume)?;
//! let uniforms = RenderUniforms::new(&volume, Window::default(), 1.0);
//! let camera = Camera::orbit(&volume, 0.6, 0.3, 1.0);
//! let pixels = renderer
//!     .render_to_rgba(uniforms, camera, 512, 512, wgpu::Color::BLACK)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod colormap;
pub mod enums;
pub mod format_reader;
pub mod gpu_renderer;
mod interpolator;
pub mod medical_file;
pub mod raymarch;
pub mod upload;
pub mod volume;

pub use colormap::{COLORMAP_SIZE, Colormap};
pub use enums::{Samples, ScanFormat};
pub use format_reader::{ParseError, ScanReader, VoxelGrid};
pub use gpu_renderer::{
    Camera, GpuContext, OFFSCREEN_FORMAT, RenderError, VolumePipeline, VolumeRenderPass,
    VolumeRenderer, VolumeTexture,
};
pub use medical_file::{
    ALLOWED_EXTENSIONS, MedicalFileInfo, UploadError, detect_format, is_supported_medical_file,
};
pub use raymarch::{RayMarchSettings, RenderUniforms, Window};
pub use upload::{LoadTicket, SlotLoad, UploadedScan, VolumeSlot, load_into_slot, load_medical_file};
pub use volume::{MAX_VOLUME_SIZE, MAX_VOXELS, VolumeData, normalize_and_downsample};

// Re-exported so callers can name clear colours and texture formats.
pub use wgpu;
