//! Offscreen rendering through the real wgpu pipeline.
//!
//! These tests need a GPU adapter (real or software fallback). When none is
//! available they print a note and return early.

use mip_volume::{
    Camera, RayMarchSettings, RenderError, RenderUniforms, Samples, VolumeRenderer, VoxelGrid,
    Window, normalize_and_downsample, wgpu,
};

const WIDTH: u32 = 96;
const HEIGHT: u32 = 64;

async fn renderer() -> Option<VolumeRenderer> {
    match VolumeRenderer::headless(&RayMarchSettings::default()).await {
        Ok(renderer) => Some(renderer),
        Err(e @ (RenderError::AdapterUnavailable | RenderError::DeviceCreation(_))) => {
            eprintln!("Skipping headless tests: no GPU adapter available ({e})");
            None
        }
        Err(e) => panic!("renderer setup failed: {e}"),
    }
}

fn sphere_volume(n: usize) -> mip_volume::VolumeData {
    let centre = (n as f32 - 1.0) / 2.0;
    let mut samples = Vec::with_capacity(n * n * n);
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let d = ((x as f32 - centre).powi(2)
                    + (y as f32 - centre).powi(2)
                    + (z as f32 - centre).powi(2))
                .sqrt();
                samples.push(if d < n as f32 / 3.0 { 200 } else { 0 });
            }
        }
    }
    let grid = VoxelGrid::new(Samples::U8(samples), (n, n, n), Some((1.0, 1.0, 1.0))).unwrap();
    normalize_and_downsample(&grid)
}

fn pixel(pixels: &[u8], x: u32, y: u32) -> &[u8] {
    let i = ((y * WIDTH + x) * 4) as usize;
    &pixels[i..i + 4]
}

#[tokio::test(flavor = "current_thread")]
async fn headless_volume_rendering() {
    let Some(mut renderer) = renderer().await else {
        return;
    };
    let volume = sphere_volume(24);
    let uniforms = RenderUniforms::new(&volume, Window::default(), 1.0);
    let camera = Camera::orbit(&volume, 0.4, 0.3, WIDTH as f32 / HEIGHT as f32);

    // --- No volume: plain background ---
    {
        let pixels = renderer
            .render_to_rgba(uniforms, camera, WIDTH, HEIGHT, wgpu::Color::BLACK)
            .await
            .expect("background render failed");
        assert_eq!(pixels.len(), (WIDTH * HEIGHT * 4) as usize);
        assert!(pixels.chunks(4).all(|px| px == [0, 0, 0, 255]));
    }

    // --- Sphere: bright centre, untouched corners ---
    {
        renderer.set_volume(&volume).expect("volume upload failed");
        assert_eq!(renderer.texture().map(|t| t.dimensions()), Some((24, 24, 24)));

        let pixels = renderer
            .render_to_rgba(uniforms, camera, WIDTH, HEIGHT, wgpu::Color::BLACK)
            .await
            .expect("volume render failed");
        assert_eq!(pixels.len(), (WIDTH * HEIGHT * 4) as usize);
        assert!(pixel(&pixels, WIDTH / 2, HEIGHT / 2)[0] > 32);
        assert_eq!(pixel(&pixels, 0, 0), [0, 0, 0, 255]);
        assert_eq!(pixel(&pixels, WIDTH - 1, HEIGHT - 1), [0, 0, 0, 255]);
    }

    // --- Replacing and clearing the volume ---
    {
        renderer
            .set_volume(&sphere_volume(12))
            .expect("volume upload failed");
        assert_eq!(renderer.texture().map(|t| t.dimensions()), Some((12, 12, 12)));
        renderer.clear_volume();
        assert!(renderer.texture().is_none());
    }

    // --- A volume longer than the 3D texture limit is refused, not fatal ---
    {
        let limit = renderer.context().device.limits().max_texture_dimension_3d as usize;
        let grid = VoxelGrid::new(Samples::U8(vec![7; limit + 1]), (limit + 1, 1, 1), None)
            .unwrap();
        let too_long = normalize_and_downsample(&grid);
        assert_eq!(too_long.dims(), (limit + 1, 1, 1));

        let result = renderer.set_volume(&too_long);
        assert!(matches!(result, Err(RenderError::TextureCreation(_, _))));
        assert!(renderer.texture().is_none());

        let pixels = renderer
            .render_to_rgba(uniforms, camera, WIDTH, HEIGHT, wgpu::Color::BLACK)
            .await
            .expect("renderer stays usable after a refused upload");
        assert!(pixels.chunks(4).all(|px| px == [0, 0, 0, 255]));
    }

    // --- Zero-sized frames are rejected ---
    {
        let result = renderer
            .render_to_rgba(uniforms, camera, 0, HEIGHT, wgpu::Color::BLACK)
            .await;
        assert!(matches!(result, Err(RenderError::EmptyFrame(0, _))));
    }
}
