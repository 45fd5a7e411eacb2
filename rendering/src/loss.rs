//! Photometric losses between a rendered image and its target.

use gs_core::{Error, Image, Result};
use rayon::prelude::*;

const SSIM_C1: f32 = 0.01 * 0.01;
const SSIM_C2: f32 = 0.03 * 0.03;

#[derive(Clone, Debug)]
pub struct LossOutput {
    pub total: f32,
    pub l1: f32,
    pub ssim: f32,
    /// dtotal/drendered, same shape as the rendered image.
    pub grad: Image,
}

pub trait Loss: Send + Sync {
    fn evaluate(&self, rendered: &Image, target: &Image) -> Result<LossOutput>;
}

/// `(1 - lambda) * L1 + lambda * (1 - SSIM)`.
#[derive(Clone, Debug)]
pub struct L1SsimLoss {
    pub lambda_dssim: f32,
    window: Vec<f32>,
}

impl Default for L1SsimLoss {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl L1SsimLoss {
    pub fn new(lambda_dssim: f32) -> Self {
        Self {
            lambda_dssim,
            window: gaussian_window(11, 1.5),
        }
    }
}

/// Normalised 1D Gaussian of odd `size`.
pub fn gaussian_window(size: usize, sigma: f32) -> Vec<f32> {
    let half = (size / 2) as f32;
    let raw: Vec<f32> = (0..size)
        .map(|i| {
            let x = i as f32 - half;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = raw.iter().sum();
    raw.into_iter().map(|v| v / sum).collect()
}

/// Separable convolution of one `width x height` plane with zero padding.
fn filter_plane(plane: &[f32], width: usize, height: usize, window: &[f32]) -> Vec<f32> {
    let half = (window.len() / 2) as isize;
    let mut horizontal = vec![0.0f32; plane.len()];
    for y in 0..height {
        let row = &plane[y * width..(y + 1) * width];
        for x in 0..width {
            let mut acc = 0.0;
            for (k, w) in window.iter().enumerate() {
                let sx = x as isize + k as isize - half;
                if sx >= 0 && (sx as usize) < width {
                    acc += w * row[sx as usize];
                }
            }
            horizontal[y * width + x] = acc;
        }
    }

    let mut out = vec![0.0f32; plane.len()];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0;
            for (k, w) in window.iter().enumerate() {
                let sy = y as isize + k as isize - half;
                if sy >= 0 && (sy as usize) < height {
                    acc += w * horizontal[sy as usize * width + x];
                }
            }
            out[y * width + x] = acc;
        }
    }
    out
}

fn check_shapes(rendered: &Image, target: &Image) -> Result<()> {
    if rendered.same_shape(target) {
        Ok(())
    } else {
        Err(Error::DimensionMismatch(format!(
            "rendered image is {}x{}x{}, target is {}x{}x{}",
            rendered.width,
            rendered.height,
            rendered.channels,
            target.width,
            target.height,
            target.channels
        )))
    }
}

/// Mean absolute error.
pub fn l1(rendered: &Image, target: &Image) -> Result<f32> {
    check_shapes(rendered, target)?;
    let sum: f64 = rendered
        .data
        .iter()
        .zip(&target.data)
        .map(|(a, b)| (a - b).abs() as f64)
        .sum();
    Ok((sum / rendered.data.len().max(1) as f64) as f32)
}

/// Peak signal-to-noise ratio for images in `[0, 1]`. Infinite for identical images.
pub fn psnr(rendered: &Image, target: &Image) -> Result<f32> {
    check_shapes(rendered, target)?;
    let sum: f64 = rendered
        .data
        .iter()
        .zip(&target.data)
        .map(|(a, b)| {
            let d = (a - b) as f64;
            d * d
        })
        .sum();
    let mse = sum / rendered.data.len().max(1) as f64;
    Ok((20.0 * (1.0 / mse.sqrt()).log10()) as f32)
}

/// SSIM map value and its gradient for one plane, both summed over pixels.
fn ssim_plane(x: &[f32], y: &[f32], width: usize, height: usize, window: &[f32]) -> (f64, Vec<f32>) {
    let filter = |p: &[f32]| filter_plane(p, width, height, window);
    let xx: Vec<f32> = x.iter().map(|v| v * v).collect();
    let yy: Vec<f32> = y.iter().map(|v| v * v).collect();
    let xy: Vec<f32> = x.iter().zip(y).map(|(a, b)| a * b).collect();

    let mu_x = filter(x);
    let mu_y = filter(y);
    let e_xx = filter(&xx);
    let e_yy = filter(&yy);
    let e_xy = filter(&xy);

    let n = x.len();
    let mut sum = 0.0f64;
    let mut a = vec![0.0f32; n];
    let mut b = vec![0.0f32; n];
    let mut c = vec![0.0f32; n];
    for p in 0..n {
        let (mx, my) = (mu_x[p], mu_y[p]);
        let sxx = e_xx[p] - mx * mx;
        let syy = e_yy[p] - my * my;
        let sxy = e_xy[p] - mx * my;

        let n1 = 2.0 * mx * my + SSIM_C1;
        let n2 = 2.0 * sxy + SSIM_C2;
        let d1 = mx * mx + my * my + SSIM_C1;
        let d2 = sxx + syy + SSIM_C2;
        let f = (n1 * n2) / (d1 * d2);
        sum += f as f64;

        let df_dmx = 2.0 * my * n2 / (d1 * d2) - f * 2.0 * mx / d1;
        let df_dsxx = -f / d2;
        let df_dsxy = 2.0 * n1 / (d1 * d2);
        a[p] = df_dmx - 2.0 * df_dsxx * mx - df_dsxy * my;
        b[p] = 2.0 * df_dsxx;
        c[p] = df_dsxy;
    }

    let fa = filter(&a);
    let fb = filter(&b);
    let fc = filter(&c);
    let grad = (0..n).map(|q| fa[q] + x[q] * fb[q] + y[q] * fc[q]).collect();
    (sum, grad)
}

/// Mean SSIM over all channels and pixels.
pub fn ssim(rendered: &Image, target: &Image) -> Result<f32> {
    check_shapes(rendered, target)?;
    let window = gaussian_window(11, 1.5);
    let (w, h) = (rendered.width as usize, rendered.height as usize);
    let total: f64 = (0..rendered.channels)
        .into_par_iter()
        .map(|c| ssim_plane(rendered.plane(c), target.plane(c), w, h, &window).0)
        .sum();
    Ok((total / rendered.data.len().max(1) as f64) as f32)
}

impl Loss for L1SsimLoss {
    fn evaluate(&self, rendered: &Image, target: &Image) -> Result<LossOutput> {
        check_shapes(rendered, target)?;
        let (w, h) = (rendered.width as usize, rendered.height as usize);
        let count = rendered.data.len().max(1);
        let lambda = self.lambda_dssim;

        let planes: Vec<(f64, Vec<f32>)> = (0..rendered.channels)
            .into_par_iter()
            .map(|c| ssim_plane(rendered.plane(c), target.plane(c), w, h, &self.window))
            .collect();
        let ssim = (planes.iter().map(|(s, _)| s).sum::<f64>() / count as f64) as f32;
        let l1 = l1(rendered, target)?;

        let mut grad = Image::new(rendered.width, rendered.height, rendered.channels);
        let plane = grad.plane_len();
        let inv = 1.0 / count as f32;
        for (c, (_, dssim)) in planes.iter().enumerate() {
            let out = grad.plane_mut(c);
            let x = &rendered.data[c * plane..(c + 1) * plane];
            let y = &target.data[c * plane..(c + 1) * plane];
            for q in 0..plane {
                let diff = x[q] - y[q];
                let sign = if diff > 0.0 {
                    1.0
                } else if diff < 0.0 {
                    -1.0
                } else {
                    0.0
                };
                out[q] = ((1.0 - lambda) * sign - lambda * dssim[q]) * inv;
            }
        }

        Ok(LossOutput {
            total: (1.0 - lambda) * l1 + lambda * (1.0 - ssim),
            l1,
            ssim,
            grad,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(w: u32, h: u32, phase: f32) -> Image {
        let mut img = Image::new(w, h, 3);
        let plane = img.plane_len();
        for c in 0..3 {
            for i in 0..plane {
                let v = ((i as f32 * 0.37 + c as f32 * 1.3 + phase).sin() * 0.4) + 0.5;
                img.data[c * plane + i] = v;
            }
        }
        img
    }

    #[test]
    fn test_window_is_normalised() {
        let w = gaussian_window(11, 1.5);
        assert_eq!(w.len(), 11);
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(w[5] > w[4] && (w[4] - w[6]).abs() < 1e-7);
    }

    #[test]
    fn test_identical_images() {
        let img = pattern(16, 12, 0.0);
        let out = L1SsimLoss::default().evaluate(&img, &img).unwrap();
        assert!(out.l1.abs() < 1e-7);
        assert!((out.ssim - 1.0).abs() < 1e-4);
        assert!(out.total.abs() < 1e-4);
        assert!(psnr(&img, &img).unwrap().is_infinite());
    }

    #[test]
    fn test_psnr_of_constant_offset() {
        let a = Image::filled(8, 8, nalgebra::Vector3::repeat(0.5));
        let b = Image::filled(8, 8, nalgebra::Vector3::repeat(0.6));
        assert!((psnr(&a, &b).unwrap() - 20.0).abs() < 1e-3);
        assert!((l1(&a, &b).unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Image::new(4, 4, 3);
        let b = Image::new(4, 5, 3);
        assert!(L1SsimLoss::default().evaluate(&a, &b).is_err());
    }
}
