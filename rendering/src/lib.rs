//! Differentiable rendering for Gaussian Splatting training
//!
//! This crate provides:
//! - Spherical harmonics evaluation and its gradient
//! - A tile-based CPU rasterizer with an analytic backward pass
//! - The L1 + D-SSIM photometric loss and PSNR

pub mod loss;
pub mod rasterize;
pub mod sh;

pub use loss::{gaussian_window, l1, psnr, ssim, L1SsimLoss, Loss, LossOutput};
pub use rasterize::{
    BackwardOutput, CpuRasterizer, Rasterizer, RenderOutput, RenderSettings, TileRect,
    NEAR_PLANE, TILE_SIZE,
};
pub use sh::{eval_sh, sh_backward, sh_basis, sh_to_color, MAX_SH_DEGREE};
