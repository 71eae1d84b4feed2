use std::{env, error::Error, fs, path::Path};

use log::{error, info};
use mip_volume::{
    Camera, RayMarchSettings, RenderUniforms, VolumeRenderer, Window, load_medical_file, wgpu,
};

const USAGE: &str = "usage: mip-volume <scan.{dcm,dicom,nii,nii.gz}> [out.png] [width] [height]";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(scan_path) = args.first() else {
        return Err(USAGE.into());
    };
    let output = args.get(1);
    let width = args.get(2).map(|w| w.parse::<u32>()).transpose()?.unwrap_or(512);
    let height = args.get(3).map(|h| h.parse::<u32>()).transpose()?.unwrap_or(width);

    let bytes = fs::read(scan_path)?;
    let file_name = Path::new(scan_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| scan_path.clone());
    let scan = load_medical_file(&file_name, &bytes)?;

    let Some(volume) = scan.volume else {
        if let Some(warning) = scan.warning {
            error!("{file_name} has no displayable volume: {warning}");
        }
        return Ok(());
    };
    let (min, max) = volume.min_max();
    info!(
        "{} ({}, {} bytes): volume {:?}, spacing {:?}, intensity [{min}, {max}]",
        scan.file.file_name,
        scan.file.format,
        scan.file.size_bytes,
        volume.dims(),
        volume.spacing(),
    );

    let Some(output) = output else {
        return Ok(());
    };

    let mut renderer = VolumeRenderer::headless(&RayMarchSettings::default()).await?;
    renderer.set_volume(&volume)?;
    let uniforms = RenderUniforms::new(&volume, Window::default(), 1.0);
    let camera = Camera::orbit(&volume, 0.6, 0.35, width as f32 / height as f32);
    let pixels = renderer
        .render_to_rgba(uniforms, camera, width, height, wgpu::Color::BLACK)
        .await?;

    let image = image::RgbaImage::from_raw(width, height, pixels)
        .ok_or("rendered frame does not match its size")?;
    image.save(output)?;
    info!("wrote {output}");
    Ok(())
}
