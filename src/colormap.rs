//! Lookup table mapping normalized intensity to colour.

/// Number of entries in a colormap texture.
pub const COLORMAP_SIZE: usize = 256;

/// An RGBA8 lookup table, sampled like a linearly filtered 256x1 texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Colormap {
    entries: Vec<[u8; 4]>,
}

impl Colormap {
    /// Linear ramp from black to white, fully opaque.
    pub fn greyscale() -> Self {
        let entries = (0..COLORMAP_SIZE)
            .map(|i| {
                let t = i as f32 / (COLORMAP_SIZE - 1) as f32;
                let v = (t * 255.0).round() as u8;
                [v, v, v, 255]
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[[u8; 4]] {
        &self.entries
    }

    /// Raw texel bytes for upload.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.entries)
    }

    /// Samples the table at `t` in [0, 1] with texel-centre linear filtering
    /// and clamp-to-edge addressing.
    pub fn sample(&self, t: f32) -> [f32; 4] {
        let n = self.entries.len();
        let src = (t * n as f32 - 0.5).clamp(0.0, (n - 1) as f32);
        let i0 = src.floor() as usize;
        let i1 = (i0 + 1).min(n - 1);
        let frac = src - i0 as f32;

        let mut color = [0.0; 4];
        for (channel, out) in color.iter_mut().enumerate() {
            let a = f32::from(self.entries[i0][channel]) / 255.0;
            let b = f32::from(self.entries[i1][channel]) / 255.0;
            *out = a + (b - a) * frac;
        }
        color
    }
}

impl Default for Colormap {
    fn default() -> Self {
        Self::greyscale()
    }
}
