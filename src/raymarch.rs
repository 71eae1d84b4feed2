//! Maximum-intensity ray marching parameters and a host-side mirror of the
//! per-fragment shader math.
//!
//! The WGSL shader in `shaders/volume_mip.wgsl` receives every constant in
//! [`RayMarchSettings`] through a generated prelude, and the functions here
//! follow the shader line for line so the marching logic can be checked
//! without a GPU.

use crate::colormap::Colormap;
use crate::interpolator::Interpolator;
use crate::volume::VolumeData;

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};

/// Ray step length in voxels.
pub const RELATIVE_STEP_SIZE: f32 = 1.2;
/// Upper bound on samples per ray, whatever the volume size.
pub const MAX_ITERATIONS: u32 = 512;
/// Fragments fainter than this are discarded.
pub const DISCARD_ALPHA: f32 = 0.05;
/// Colormap alpha is scaled by this before blending.
pub const ALPHA_SCALE: f32 = 0.95;
/// Window-level threshold uploaded with the uniforms.
pub const DEFAULT_RENDER_THRESHOLD: f32 = 0.5;

/// Tunables shared by the shader and [`shade_fragment`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayMarchSettings {
    pub relative_step_size: f32,
    pub max_iterations: u32,
    pub alpha_scale: f32,
    pub discard_alpha: f32,
    pub ambient_color: [f32; 4],
    pub diffuse_color: [f32; 4],
    pub specular_color: [f32; 4],
    pub shininess: f32,
}

impl Default for RayMarchSettings {
    fn default() -> Self {
        Self {
            relative_step_size: RELATIVE_STEP_SIZE,
            max_iterations: MAX_ITERATIONS,
            alpha_scale: ALPHA_SCALE,
            discard_alpha: DISCARD_ALPHA,
            ambient_color: [0.25, 0.3, 0.35, 1.0],
            diffuse_color: [0.6, 0.65, 0.7, 1.0],
            specular_color: [1.0, 1.0, 1.0, 0.4],
            shininess: 32.0,
        }
    }
}

impl RayMarchSettings {
    /// WGSL `const` declarations consumed by the volume shader.
    pub fn wgsl_prelude(&self) -> String {
        let vec4 = |c: [f32; 4]| {
            format!(
                "vec4<f32>({:?}, {:?}, {:?}, {:?})",
                c[0], c[1], c[2], c[3]
            )
        };
        format!(
            "const RELATIVE_STEP_SIZE: f32 = {:?};\n\
             const MAX_ITERATIONS: i32 = {};\n\
             const ALPHA_SCALE: f32 = {:?};\n\
             const DISCARD_ALPHA: f32 = {:?};\n\
             const SHININESS: f32 = {:?};\n\
             const AMBIENT_COLOR: vec4<f32> = {};\n\
             const DIFFUSE_COLOR: vec4<f32> = {};\n\
             const SPECULAR_COLOR: vec4<f32> = {};\n",
            self.relative_step_size,
            self.max_iterations,
            self.alpha_scale,
            self.discard_alpha,
            self.shininess,
            vec4(self.ambient_color),
            vec4(self.diffuse_color),
            vec4(self.specular_color),
        )
    }
}

/// Intensity window applied before the colormap lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    /// Bounds in normalized [0, 1] units.
    Normalized { low: f32, high: f32 },
    /// Bounds in source intensities, mapped through the volume's min/max.
    Raw { low: f64, high: f64 },
}

impl Default for Window {
    fn default() -> Self {
        Window::Normalized {
            low: 0.0,
            high: 1.0,
        }
    }
}

impl Window {
    fn to_clim(self, min_max: (f64, f64)) -> [f32; 2] {
        let (low, high) = match self {
            Window::Normalized { low, high } => (low, high),
            Window::Raw { low, high } => {
                let (min, max) = min_max;
                let range = if max - min == 0.0 { 1.0 } else { max - min };
                (((low - min) / range) as f32, ((high - min) / range) as f32)
            }
        };
        // An empty window would divide by zero in the shader.
        if high == low {
            [low, low + (low.abs() * f32::EPSILON).max(f32::EPSILON)]
        } else {
            [low, high]
        }
    }
}

/// Per-volume shader inputs, recomputed when the volume or window changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderUniforms {
    pub size: [f32; 3],
    pub clim: [f32; 2],
    pub renderthreshold: f32,
    pub opacity: f32,
}

impl RenderUniforms {
    pub fn new(volume: &VolumeData, window: Window, opacity: f32) -> Self {
        let (nx, ny, nz) = volume.dims();
        Self {
            size: [nx as f32, ny as f32, nz as f32],
            clim: window.to_clim(volume.min_max()),
            renderthreshold: DEFAULT_RENDER_THRESHOLD,
            opacity: opacity.clamp(0.0, 1.0),
        }
    }

    pub fn size(&self) -> Vec3 {
        Vec3::from_array(self.size)
    }
}

/// Interpolated vertex outputs for one fragment, in voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fragment {
    /// Point on the volume's back face.
    pub position: Vec3,
    /// A point one unit in front of the camera, in volume space.
    pub nearpos: Vec3,
    /// A point one unit behind the camera, in volume space.
    pub farpos: Vec3,
}

impl Fragment {
    /// Reproduces the vertex stage for a single back-face point.
    pub fn from_model_view(position: Vec3, model_view: Mat4) -> Self {
        let inverse = model_view.inverse();
        let mut pos_in_cam = model_view * position.extend(1.0);

        pos_in_cam.z = -pos_in_cam.w;
        let near = inverse * pos_in_cam;
        pos_in_cam.z = pos_in_cam.w;
        let far = inverse * pos_in_cam;

        Self {
            position,
            nearpos: near.xyz() / near.w,
            farpos: far.xyz() / far.w,
        }
    }

    /// Unit direction from the camera into the scene.
    pub fn view_ray(&self) -> Vec3 {
        (self.nearpos - self.farpos).normalize()
    }
}

/// Signed distance from the back-face point to where the ray enters the
/// volume box `[-0.5, size - 0.5]`, found with the slab method. The result is
/// negative when the entry point lies in front of the back face.
pub fn entry_distance(fragment: &Fragment, view_ray: Vec3, size: Vec3) -> f32 {
    let position = fragment.position;
    let mut distance = (fragment.nearpos - position).dot(view_ray);
    for axis in 0..3 {
        let t0 = (-0.5 - position[axis]) / view_ray[axis];
        let t1 = (size[axis] - 0.5 - position[axis]) / view_ray[axis];
        distance = distance.max(t0.min(t1));
    }
    distance
}

/// Number of samples between the entry point and the back face. Values
/// below one mean the ray misses the volume.
pub fn step_count(distance: f32, relative_step_size: f32) -> i32 {
    (-distance / relative_step_size + 0.5) as i32
}

/// Brightest sample along the ray and the step it was found at.
pub fn march_max(
    volume: &VolumeData,
    start_loc: Vec3,
    step: Vec3,
    nsteps: i32,
    max_iterations: u32,
) -> (f32, i32) {
    let limit = nsteps.min(max_iterations as i32);
    let mut max_val = -1e6_f32;
    let mut max_i = 0;
    let mut loc = start_loc;
    for iter in 0..limit {
        let val = sample_volume(volume, loc);
        if val > max_val {
            max_val = val;
            max_i = iter;
        }
        loc += step;
    }
    (max_val, max_i)
}

/// Central-difference normal at `loc`, oriented along the view ray.
pub fn surface_normal(volume: &VolumeData, loc: Vec3, size: Vec3, view_ray: Vec3) -> Vec3 {
    let d = 1.0 / size.min_element();
    let gradient = Vec3::new(
        sample_volume(volume, loc - Vec3::X * d) - sample_volume(volume, loc + Vec3::X * d),
        sample_volume(volume, loc - Vec3::Y * d) - sample_volume(volume, loc + Vec3::Y * d),
        sample_volume(volume, loc - Vec3::Z * d) - sample_volume(volume, loc + Vec3::Z * d),
    );
    let normal = gradient.try_normalize().unwrap_or(view_ray);
    if normal.dot(view_ray) > 0.0 {
        normal
    } else {
        -normal
    }
}

/// Headlight shading of a colormap colour.
pub fn shade(color: Vec4, normal: Vec3, view_ray: Vec3, settings: &RayMarchSettings) -> Vec4 {
    let light = view_ray.normalize();
    let lambert = normal.dot(light).clamp(0.0, 1.0);
    let half_vector = (light + view_ray).normalize();
    let specular = half_vector.dot(normal).max(0.0).powf(settings.shininess);

    let ambient = Vec4::from_array(settings.ambient_color);
    let diffuse = Vec4::from_array(settings.diffuse_color);
    let specular_color = Vec4::from_array(settings.specular_color);

    let mut shaded = color * (ambient + diffuse * lambert) + specular_color * specular;
    shaded.w = color.w * settings.alpha_scale;
    shaded
}

/// Runs the whole fragment stage for one pixel. `None` means the fragment
/// is discarded and contributes nothing to the frame.
pub fn shade_fragment(
    volume: &VolumeData,
    colormap: &Colormap,
    uniforms: &RenderUniforms,
    settings: &RayMarchSettings,
    fragment: &Fragment,
) -> Option<Vec4> {
    let size = uniforms.size();
    let view_ray = fragment.view_ray();
    let distance = entry_distance(fragment, view_ray, size);
    let front = fragment.position + view_ray * distance;
    let nsteps = step_count(distance, settings.relative_step_size);
    if nsteps < 1 {
        return None;
    }

    let step = ((fragment.position - front) / size) / nsteps as f32;
    let start_loc = front / size;
    let (max_val, max_i) = march_max(volume, start_loc, step, nsteps, settings.max_iterations);

    // Only the normal is taken half a step before the brightest sample.
    let iloc = start_loc + step * (max_i as f32 - 0.5);
    let normal = surface_normal(volume, iloc, size, view_ray);

    let [low, high] = uniforms.clim;
    let t = ((max_val - low) / (high - low)).clamp(0.0, 1.0);
    let color = Vec4::from_array(colormap.sample(t));

    let mut shaded = shade(color, normal, view_ray, settings);
    shaded.w *= uniforms.opacity;
    (shaded.w >= settings.discard_alpha).then_some(shaded)
}

fn sample_volume(volume: &VolumeData, texcoords: Vec3) -> f32 {
    Interpolator::trilinear_sample(&volume.data().view(), texcoords.to_array())
}
