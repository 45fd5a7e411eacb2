//! Adaptive-density training for 3D Gaussian Splatting
//!
//! This crate drives the optimization of a [`gs_core::PrimitiveSet`]:
//! - [`model::GaussianModel`]: primitives, Adam state and staged gradients kept in lockstep
//! - [`densify::DensityController`]: clone / split / prune / opacity-reset decisions
//! - [`camera_stream`]: pool and cyclic camera sampling policies
//! - [`trainer::Trainer`]: the per-iteration state machine
//! - [`checkpoint`], [`io`]: persistence of training state and scene exports
//!
//! ## Example
//!
//! ```rust,no_run
//! use gs_rendering::{CpuRasterizer, L1SsimLoss};
//! use gs_train::{LogObserver, TrainConfig, Trainer};
//!
//! let mut config = TrainConfig::default();
//! config.model.source_path = "data/scene".into();
//! config.model.model_path = "output/scene".into();
//!
//! let mut trainer = Trainer::from_config(
//!     config,
//!     Box::new(CpuRasterizer::default()),
//!     Box::new(L1SsimLoss::default()),
//! )
//! .unwrap();
//! trainer.add_observer(Box::new(LogObserver::default()));
//! trainer.train().unwrap();
//! ```

pub mod camera_stream;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod densify;
pub mod io;
pub mod model;
pub mod observer;
pub mod trainer;
pub mod viewer;

pub use camera_stream::{build_camera_stream, CameraLoader, CameraStream, CyclicStream, PoolStream};
pub use checkpoint::Checkpoint;
pub use config::{DatasetMode, ModelConfig, OptimizationConfig, PipelineConfig, RunConfig, TrainConfig};
pub use dataset::{DatasetLoader, SceneDataset};
pub use densify::{DensifyConfig, DensifyReport, DensityController, DensityStep, Selection};
pub use model::{GaussianModel, ModelSnapshot};
pub use observer::{JsonlObserver, LogObserver, Observers, TrainingEvent, TrainingObserver};
pub use trainer::{TrainSummary, Trainer};
pub use viewer::{NoViewer, ViewerChannel, ViewerPoll, ViewerRequest};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Core error: {0}")]
    Core(#[from] gs_core::Error),

    #[error("Empty camera set: {0}")]
    EmptyCameraSet(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
