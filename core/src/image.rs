//! Planar floating point images.
//!
//! Rendering, losses and camera targets all work on [`Image`]: `channels`
//! planes of `width * height` values in `[0, 1]`, stored channel-major.

use image::{DynamicImage, Rgb, RgbImage};
use nalgebra::Vector3;

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl Image {
    pub fn new(width: u32, height: u32, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0.0; width as usize * height as usize * channels],
        }
    }

    pub fn filled(width: u32, height: u32, color: Vector3<f32>) -> Self {
        let mut img = Self::new(width, height, 3);
        for c in 0..3 {
            img.plane_mut(c).fill(color[c]);
        }
        img
    }

    /// Converts an 8-bit image, compositing any alpha channel onto `background`.
    pub fn from_dynamic(img: &DynamicImage, background: Vector3<f32>) -> Self {
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        let mut out = Self::new(width, height, 3);
        let plane = out.plane_len();
        for (i, px) in rgba.pixels().enumerate() {
            let alpha = px[3] as f32 / 255.0;
            for c in 0..3 {
                let v = px[c] as f32 / 255.0;
                out.data[c * plane + i] = v * alpha + background[c] * (1.0 - alpha);
            }
        }
        out
    }

    pub fn to_rgb8(&self) -> RgbImage {
        let plane = self.plane_len();
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let i = (y * self.width + x) as usize;
            let mut px = [0u8; 3];
            for (c, out) in px.iter_mut().enumerate() {
                let src = if c < self.channels { c } else { 0 };
                *out = (self.data[src * plane + i].clamp(0.0, 1.0) * 255.0).round() as u8;
            }
            Rgb(px)
        })
    }

    pub fn plane_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn plane(&self, c: usize) -> &[f32] {
        let n = self.plane_len();
        &self.data[c * n..(c + 1) * n]
    }

    pub fn plane_mut(&mut self, c: usize) -> &mut [f32] {
        let n = self.plane_len();
        &mut self.data[c * n..(c + 1) * n]
    }

    pub fn pixel(&self, x: u32, y: u32) -> Vector3<f32> {
        let n = self.plane_len();
        let i = (y * self.width + x) as usize;
        Vector3::new(self.data[i], self.data[n + i], self.data[2 * n + i])
    }

    pub fn same_shape(&self, other: &Image) -> bool {
        self.width == other.width && self.height == other.height && self.channels == other.channels
    }

    /// Multiplies every colour plane by a single-channel mask of the same size.
    pub fn apply_mask(&mut self, mask: &Image) -> crate::Result<()> {
        if mask.width != self.width || mask.height != self.height || mask.channels != 1 {
            return Err(crate::Error::DimensionMismatch(format!(
                "mask {}x{}x{} does not fit image {}x{}",
                mask.width, mask.height, mask.channels, self.width, self.height
            )));
        }
        for c in 0..self.channels {
            for (v, m) in self.plane_mut(c).iter_mut().zip(mask.data.iter()) {
                *v *= m;
            }
        }
        Ok(())
    }

    pub fn clamped(&self) -> Self {
        let mut out = self.clone();
        for v in &mut out.data {
            *v = v.clamp(0.0, 1.0);
        }
        out
    }
}
