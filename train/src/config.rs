//! Training configuration.
//!
//! Every section deserializes with defaults, so a TOML file only needs the
//! keys it overrides:
//!
//! ```toml
//! [model]
//! source_path = "data/garden"
//! white_background = true
//!
//! [optimization]
//! iterations = 7000
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetMode {
    /// All cameras decoded up front, drawn from a shrinking random pool.
    #[default]
    Preloaded,
    /// Cameras decoded on demand, visited in a repeating sequence.
    Streamed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub sh_degree: usize,
    pub source_path: PathBuf,
    /// Output directory. Empty means `./output/<unique name>`.
    pub model_path: PathBuf,
    pub images: String,
    /// Integer downscale factor applied to every input image.
    pub resolution: u32,
    pub white_background: bool,
    pub random_background: bool,
    /// Hold out every `llffhold`-th camera as a test view.
    pub eval: bool,
    pub llffhold: usize,
    pub dataset_mode: DatasetMode,
    /// Points sampled when the scene ships no point cloud.
    pub random_init_points: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            sh_degree: 3,
            source_path: PathBuf::new(),
            model_path: PathBuf::new(),
            images: "images".to_string(),
            resolution: 1,
            white_background: false,
            random_background: false,
            eval: false,
            llffhold: 8,
            dataset_mode: DatasetMode::Preloaded,
            random_init_points: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizationConfig {
    pub iterations: usize,
    pub position_lr_init: f32,
    pub position_lr_final: f32,
    pub position_lr_delay_mult: f32,
    pub position_lr_max_steps: usize,
    pub feature_lr: f32,
    pub opacity_lr: f32,
    pub scaling_lr: f32,
    pub rotation_lr: f32,
    pub percent_dense: f32,
    pub lambda_dssim: f32,
    pub densification_interval: usize,
    pub opacity_reset_interval: usize,
    pub densify_from_iter: usize,
    pub densify_until_iter: usize,
    pub densify_grad_threshold: f32,
    pub min_opacity: f32,
    /// Screen radius in pixels above which primitives are pruned.
    pub max_screen_size: f32,
    pub sh_increase_interval: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            iterations: 30_000,
            position_lr_init: 1.6e-4,
            position_lr_final: 1.6e-6,
            position_lr_delay_mult: 0.01,
            position_lr_max_steps: 30_000,
            feature_lr: 0.0025,
            opacity_lr: 0.05,
            scaling_lr: 0.005,
            rotation_lr: 0.001,
            percent_dense: 0.01,
            lambda_dssim: 0.2,
            densification_interval: 100,
            opacity_reset_interval: 3000,
            densify_from_iter: 500,
            densify_until_iter: 15_000,
            densify_grad_threshold: 0.0002,
            min_opacity: 0.005,
            max_screen_size: 20.0,
            sh_increase_interval: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub debug: bool,
    pub scaling_modifier: f32,
    pub tile_size: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debug: false,
            scaling_modifier: 1.0,
            tile_size: gs_rendering::TILE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub test_iterations: Vec<usize>,
    pub save_iterations: Vec<usize>,
    pub checkpoint_iterations: Vec<usize>,
    pub start_checkpoint: Option<PathBuf>,
    /// Rasterizer debug checks are enabled from this iteration on.
    pub debug_from: Option<usize>,
    pub seed: u64,
    pub threads: Option<usize>,
    /// Emits percentile summaries of the primitive statistics.
    pub telemetry: bool,
    pub quiet: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            test_iterations: vec![7000, 30_000],
            save_iterations: vec![7000, 30_000],
            checkpoint_iterations: Vec::new(),
            start_checkpoint: None,
            debug_from: None,
            seed: 0,
            threads: None,
            telemetry: false,
            quiet: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub model: ModelConfig,
    pub optimization: OptimizationConfig,
    pub pipeline: PipelineConfig,
    pub run: RunConfig,
}

impl TrainConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Makes the final iteration always saved and fills in a default output
    /// directory when none was given.
    pub fn finalize(&mut self) {
        let last = self.optimization.iterations;
        if !self.run.save_iterations.contains(&last) {
            self.run.save_iterations.push(last);
        }
        if self.model.model_path.as_os_str().is_empty() {
            self.model.model_path = default_model_path();
        }
    }

    /// Writes the resolved configuration to `<dir>/cfg_args`.
    pub fn write_cfg_args(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join("cfg_args");
        fs::write(&path, self.to_toml_string()?)?;
        Ok(path)
    }

    pub fn validate(&self) -> Result<()> {
        let opt = &self.optimization;
        if opt.iterations == 0 {
            return Err(Error::Config("iterations must be at least 1".into()));
        }
        if opt.densification_interval == 0 || opt.opacity_reset_interval == 0 {
            return Err(Error::Config(
                "densification and opacity reset intervals must be non-zero".into(),
            ));
        }
        if opt.sh_increase_interval == 0 {
            return Err(Error::Config("sh_increase_interval must be non-zero".into()));
        }
        for (name, lr) in [
            ("position_lr_init", opt.position_lr_init),
            ("position_lr_final", opt.position_lr_final),
            ("feature_lr", opt.feature_lr),
            ("opacity_lr", opt.opacity_lr),
            ("scaling_lr", opt.scaling_lr),
            ("rotation_lr", opt.rotation_lr),
        ] {
            if !lr.is_finite() || lr < 0.0 {
                return Err(Error::Config(format!("{name} must be finite and >= 0, got {lr}")));
            }
        }
        if self.model.sh_degree > gs_rendering::MAX_SH_DEGREE {
            return Err(Error::Config(format!(
                "sh_degree {} exceeds the supported maximum {}",
                self.model.sh_degree,
                gs_rendering::MAX_SH_DEGREE
            )));
        }
        if self.model.resolution == 0 {
            return Err(Error::Config("resolution must be at least 1".into()));
        }
        if self.pipeline.tile_size == 0 {
            return Err(Error::Config("tile_size must be non-zero".into()));
        }
        Ok(())
    }
}

fn default_model_path() -> PathBuf {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    PathBuf::from("output").join(format!("{:x}-{}", stamp, std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = TrainConfig::from_toml_str(
            r#"
            [model]
            source_path = "data/garden"
            dataset_mode = "streamed"

            [optimization]
            iterations = 7000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model.source_path, PathBuf::from("data/garden"));
        assert_eq!(cfg.model.dataset_mode, DatasetMode::Streamed);
        assert_eq!(cfg.optimization.iterations, 7000);
        assert_eq!(cfg.optimization.densify_until_iter, 15_000);
        assert_eq!(cfg.run.test_iterations, vec![7000, 30_000]);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = TrainConfig::from_toml_str("[model]\nsh_degre = 2\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_finalize_appends_last_iteration() {
        let mut cfg = TrainConfig::default();
        cfg.optimization.iterations = 500;
        cfg.finalize();
        assert_eq!(cfg.run.save_iterations, vec![7000, 30_000, 500]);
        assert!(cfg.model.model_path.starts_with("output"));

        cfg.finalize();
        assert_eq!(cfg.run.save_iterations.len(), 3);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut cfg = TrainConfig::default();
        cfg.run.start_checkpoint = Some(PathBuf::from("out/chkpnt7000.bin"));
        cfg.run.checkpoint_iterations = vec![10];
        let text = cfg.to_toml_string().unwrap();
        assert_eq!(TrainConfig::from_toml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut cfg = TrainConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.optimization.densification_interval = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_learning_rates() {
        let mut cfg = TrainConfig::default();
        cfg.optimization.position_lr_final = 0.0;
        assert!(cfg.validate().is_ok());
        cfg.optimization.opacity_lr = -0.05;
        assert!(cfg.validate().is_err());
        cfg.optimization.opacity_lr = 0.05;
        cfg.optimization.position_lr_init = f32::NAN;
        assert!(cfg.validate().is_err());
    }
}
