//! Core data types shared by the Gaussian Splatting trainer crates.
//!
//! - [`primitives::PrimitiveSet`]: structure-of-arrays storage for every Gaussian
//! - [`rows::RowMapping`]: explicit old-row to new-row mapping for cardinality changes
//! - [`camera::Camera`]: an immutable training view (pose, intrinsics, target image)
//! - [`image::Image`]: planar `f32` images used by rendering and losses

pub mod camera;
pub mod image;
pub mod point_cloud;
pub mod primitives;
pub mod rows;
pub mod runtime;

pub use camera::{extent_of_centers, focal_to_fov, fov_to_focal, scene_extent, Camera, CameraJson};
pub use image::Image;
pub use point_cloud::PointCloud;
pub use primitives::{
    inverse_sigmoid, sigmoid, sh_coeff_count, DensityStats, ParamBuffer, ParamGradients,
    ParamGroup, Primitive, PrimitiveSet, StatField, SH_C0,
};
pub use rows::RowMapping;
pub use runtime::{current_cpu_threads, init_global_thread_pool};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] ::image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;
