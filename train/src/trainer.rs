//! The training loop.
//!
//! Each iteration services the viewer, updates learning rates, draws a
//! camera, renders, back-propagates the loss, reports, saves, runs density
//! control and finally steps the optimizer. Everything runs on the calling
//! thread; the rasterizer and loss may parallelise internally but return
//! before the model is touched again.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gs_core::{Camera, CameraJson};
use gs_rendering::{l1, psnr, Loss, Rasterizer, RenderOutput, RenderSettings};
use nalgebra::Vector3;

use crate::camera_stream::{build_camera_stream, CameraLoader, CameraStream};
use crate::checkpoint::Checkpoint;
use crate::config::TrainConfig;
use crate::dataset::SceneDataset;
use crate::densify::{DensifyConfig, DensityController};
use crate::model::GaussianModel;
use crate::observer::{histogram, percentiles, Observers, TrainingEvent, TrainingObserver};
use crate::viewer::{ViewerChannel, ViewerPoll};
use crate::{io, Error, Result};

/// Wait between polls while a kept-alive viewer holds the last iteration.
const VIEWER_IDLE_POLL: Duration = Duration::from_millis(10);

/// Training views sampled for evaluation: `5, 10, 15, 20, 25` modulo the count.
const TRAIN_EVAL_INDICES: [usize; 5] = [5, 10, 15, 20, 25];

/// Cameras rendered at evaluation iterations.
#[derive(Debug, Clone)]
pub struct EvalSet {
    pub name: String,
    pub cameras: Vec<Arc<Camera>>,
}

#[derive(Debug, Clone, Default)]
pub struct TrainSummary {
    pub first_iteration: usize,
    pub last_iteration: usize,
    pub num_points: usize,
    pub ema_loss: f32,
    pub densify_passes: usize,
    pub opacity_resets: usize,
    pub saved: Vec<PathBuf>,
    pub checkpoints: Vec<PathBuf>,
    pub elapsed: Duration,
}

pub struct Trainer {
    config: TrainConfig,
    model: GaussianModel,
    density: DensityController,
    cameras: Box<dyn CameraStream>,
    eval_sets: Vec<EvalSet>,
    rasterizer: Box<dyn Rasterizer>,
    loss: Box<dyn Loss>,
    observers: Observers,
    viewer: Option<Box<dyn ViewerChannel>>,
    background: Vector3<f32>,
    debug: bool,
    first_iter: usize,
    ema_loss: f32,
}

impl Trainer {
    pub fn new(
        config: TrainConfig,
        model: GaussianModel,
        cameras: Box<dyn CameraStream>,
        extent: f32,
        rasterizer: Box<dyn Rasterizer>,
        loss: Box<dyn Loss>,
    ) -> Result<Self> {
        config.validate()?;
        if cameras.is_empty() {
            return Err(Error::EmptyCameraSet("camera stream is empty".into()));
        }
        let density = DensityController::new(
            DensifyConfig::from_optimization(&config.optimization, config.model.white_background),
            extent,
            config.run.seed,
        );
        let background = if config.model.white_background {
            Vector3::repeat(1.0)
        } else {
            Vector3::zeros()
        };
        Ok(Self {
            debug: config.pipeline.debug,
            config,
            model,
            density,
            cameras,
            eval_sets: Vec::new(),
            rasterizer,
            loss,
            observers: Observers::default(),
            viewer: None,
            background,
            first_iter: 0,
            ema_loss: 0.0,
        })
    }

    /// Loads the scene described by `config`, prepares the output directory
    /// and resumes from `run.start_checkpoint` when one is set.
    pub fn from_config(
        mut config: TrainConfig,
        rasterizer: Box<dyn Rasterizer>,
        loss: Box<dyn Loss>,
    ) -> Result<Self> {
        config.finalize();
        config.validate()?;
        let seed = config.run.seed;

        let dataset = SceneDataset::load(&config.model.source_path, &config.model, seed)?;
        let model_path = config.model.model_path.clone();
        tracing::info!("Output folder: {}", model_path.display());
        config.write_cfg_args(&model_path)?;
        io::write_point_cloud_ply(&dataset.point_cloud, model_path.join("input.ply"))?;
        let entries: Vec<CameraJson> = dataset
            .train_entries()
            .iter()
            .chain(dataset.test_entries())
            .cloned()
            .collect();
        io::write_cameras_json(&entries, model_path.join("cameras.json"))?;

        let model = GaussianModel::from_point_cloud(
            &dataset.point_cloud,
            config.model.sh_degree,
            &config.optimization,
            dataset.extent,
        )?;

        let wants_eval = !config.run.test_iterations.is_empty();
        let mut eval_sets = Vec::new();
        if wants_eval {
            let mut loader = dataset.train_loader(false, seed);
            let count = loader.len();
            let cameras = TRAIN_EVAL_INDICES
                .iter()
                .map(|i| loader.load(i % count))
                .collect::<Result<Vec<_>>>()?;
            eval_sets.push(EvalSet {
                name: "train".into(),
                cameras,
            });
            eval_sets.push(EvalSet {
                name: "test".into(),
                cameras: dataset.test_cameras()?,
            });
        }

        let stream = build_camera_stream(
            config.model.dataset_mode,
            dataset.train_loader(config.model.random_background, seed),
            seed,
        )?;
        let start_checkpoint = config.run.start_checkpoint.clone();

        let mut trainer = Self::new(config, model, stream, dataset.extent, rasterizer, loss)?;
        trainer.eval_sets = eval_sets;
        if let Some(path) = start_checkpoint {
            trainer.resume(Checkpoint::load(&path)?)?;
            tracing::info!(
                "Resumed from {} at iteration {}",
                path.display(),
                trainer.first_iter
            );
        }
        Ok(trainer)
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &GaussianModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut GaussianModel {
        &mut self.model
    }

    pub fn density(&self) -> &DensityController {
        &self.density
    }

    /// Last iteration already trained; training continues at the next one.
    pub fn start_iteration(&self) -> usize {
        self.first_iter
    }

    pub fn add_observer(&mut self, observer: Box<dyn TrainingObserver>) {
        self.observers.push(observer);
    }

    pub fn add_eval_set(&mut self, name: impl Into<String>, cameras: Vec<Arc<Camera>>) {
        self.eval_sets.push(EvalSet {
            name: name.into(),
            cameras,
        });
    }

    pub fn set_viewer(&mut self, viewer: Box<dyn ViewerChannel>) {
        self.viewer = Some(viewer);
    }

    pub fn resume(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let (model, iteration) = checkpoint.restore()?;
        self.model = model;
        self.first_iter = iteration;
        Ok(())
    }

    fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            active_sh_degree: self.model.active_sh_degree(),
            scaling_modifier: self.config.pipeline.scaling_modifier,
            debug: self.debug,
        }
    }

    pub fn train(&mut self) -> Result<TrainSummary> {
        let start = Instant::now();
        let iterations = self.config.optimization.iterations;
        let first = self.first_iter + 1;
        let telemetry_interval = 10 * self.config.optimization.densification_interval;
        let mut summary = TrainSummary {
            first_iteration: first,
            ..TrainSummary::default()
        };

        for iteration in first..=iterations {
            let iter_start = Instant::now();
            self.serve_viewer(iteration);

            self.model.update_learning_rate(iteration);
            if iteration % self.config.optimization.sh_increase_interval == 0 {
                self.model.oneup_sh_degree();
            }

            let camera = self.cameras.next_camera()?;
            if self.config.run.debug_from == Some(iteration - 1) {
                self.debug = true;
            }

            let settings = self.render_settings();
            let background = camera.background;
            let render = self
                .rasterizer
                .render(&camera, &self.model.primitives, &settings, &background)?;
            let loss = self.loss.evaluate(&render.image, &camera.image)?;
            let backward = self.rasterizer.backward(
                &camera,
                &self.model.primitives,
                &settings,
                &background,
                &render,
                &loss.grad,
            )?;
            self.model.stage_gradients(backward.params)?;
            self.ema_loss = 0.4 * loss.total + 0.6 * self.ema_loss;

            self.observers.notify(&TrainingEvent::Iteration {
                iteration,
                loss: loss.total,
                ema_loss: self.ema_loss,
                l1: loss.l1,
                num_points: self.model.len(),
                elapsed_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
            });
            if iteration == 1 || self.config.run.test_iterations.contains(&iteration) {
                self.evaluate(iteration)?;
            }
            if iteration == first || self.config.run.save_iterations.contains(&iteration) {
                let path = io::save_iteration(
                    &self.model.primitives,
                    &self.config.model.model_path,
                    iteration,
                )?;
                self.observers
                    .notify(&TrainingEvent::Saved { iteration, path: path.clone() });
                summary.saved.push(path);
            }
            if self.config.run.telemetry && iteration % telemetry_interval == 0 {
                let event = self.percentile_event(iteration, &render);
                self.observers.notify(&event);
            }

            let step = self
                .density
                .step(&mut self.model, iteration, &render, &backward.screen_space)?;
            if let Some(report) = step.report {
                summary.densify_passes += 1;
                self.observers.notify(&TrainingEvent::Densified(report));
            }
            if step.opacity_reset {
                summary.opacity_resets += 1;
                self.observers
                    .notify(&TrainingEvent::OpacityReset { iteration });
            }

            if iteration < iterations {
                self.model.step()?;
            }
            self.model.zero_gradients();

            if self.config.run.checkpoint_iterations.contains(&iteration) {
                let path = Checkpoint::path_for(&self.config.model.model_path, iteration);
                Checkpoint::capture(&self.model, iteration).save(&path)?;
                self.observers
                    .notify(&TrainingEvent::Checkpointed { iteration, path: path.clone() });
                summary.checkpoints.push(path);
            }
            summary.last_iteration = iteration;
        }

        self.first_iter = summary.last_iteration.max(self.first_iter);
        self.observers.flush();
        summary.num_points = self.model.len();
        summary.ema_loss = self.ema_loss;
        summary.elapsed = start.elapsed();
        tracing::info!(
            "Training complete: {} points, loss {:.7}, {:.1}s",
            summary.num_points,
            summary.ema_loss,
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }

    /// Answers pending viewer requests. Errors only reset the channel.
    fn serve_viewer(&mut self, iteration: usize) {
        let last = iteration >= self.config.optimization.iterations;
        let Some(viewer) = self.viewer.as_mut() else {
            return;
        };
        let mut held = false;
        loop {
            match viewer.poll() {
                ViewerPoll::Idle if held => std::thread::sleep(VIEWER_IDLE_POLL),
                ViewerPoll::Idle => break,
                ViewerPoll::Disconnected => {
                    viewer.reset();
                    break;
                }
                ViewerPoll::Render(request) => {
                    let settings = RenderSettings {
                        active_sh_degree: self.model.active_sh_degree(),
                        scaling_modifier: request.scaling_modifier,
                        debug: false,
                    };
                    let sent = self
                        .rasterizer
                        .render(&request.camera, &self.model.primitives, &settings, &self.background)
                        .map_err(Error::from)
                        .and_then(|out| viewer.send(&out.image.clamped()));
                    if let Err(e) = sent {
                        tracing::debug!("viewer dropped at iteration {}: {}", iteration, e);
                        viewer.reset();
                        break;
                    }
                    held = last && request.keep_alive;
                    if request.do_training && !held {
                        break;
                    }
                }
            }
        }
    }

    /// Average L1 and PSNR of every evaluation set, then the opacity histogram.
    pub fn evaluate(&mut self, iteration: usize) -> Result<()> {
        let settings = RenderSettings {
            debug: false,
            ..self.render_settings()
        };
        for set in &self.eval_sets {
            if set.cameras.is_empty() {
                continue;
            }
            let mut l1_sum = 0.0f64;
            let mut psnr_sum = 0.0f64;
            for camera in &set.cameras {
                let out = self.rasterizer.render(
                    camera,
                    &self.model.primitives,
                    &settings,
                    &self.background,
                )?;
                let rendered = out.image.clamped();
                let target = camera.image.clamped();
                l1_sum += l1(&rendered, &target)? as f64;
                psnr_sum += psnr(&rendered, &target)? as f64;
            }
            let n = set.cameras.len() as f64;
            self.observers.notify(&TrainingEvent::Evaluation {
                iteration,
                split: set.name.clone(),
                l1: (l1_sum / n) as f32,
                psnr: (psnr_sum / n) as f32,
            });
        }
        self.observers.notify(&TrainingEvent::Histogram {
            iteration,
            opacity: histogram(&self.model.primitives.opacities(), 10),
            num_points: self.model.len(),
        });
        Ok(())
    }

    fn percentile_event(&self, iteration: usize, render: &RenderOutput) -> TrainingEvent {
        let prims = &self.model.primitives;
        let scales = prims.scales();
        let per_scale = |f: fn(&Vector3<f32>) -> f32| -> Vec<f32> {
            percentiles(&scales.iter().map(f).collect::<Vec<_>>())
        };
        let visible = |values: &[f32]| -> Vec<f32> {
            let kept: Vec<f32> = values
                .iter()
                .zip(&render.visibility)
                .filter_map(|(&v, &vis)| vis.then_some(v))
                .collect();
            percentiles(&kept)
        };
        let scaling_grad = self
            .model
            .staged_gradients()
            .and_then(|g| g.scalings.as_ref())
            .map(|g| percentiles(g.as_slice()))
            .unwrap_or_else(|| percentiles(&[]));
        TrainingEvent::Percentiles {
            iteration,
            scale_max: per_scale(|s| s.max()),
            scale_min: per_scale(|s| s.min()),
            scale_median: per_scale(|s| {
                let mut v = [s.x, s.y, s.z];
                v.sort_by(f32::total_cmp);
                v[1]
            }),
            scale_mean: per_scale(|s| s.mean()),
            scale_max_div_min: per_scale(|s| s.max() / s.min()),
            scaling_grad,
            opacity: percentiles(&prims.opacities()),
            max_radii: visible(&prims.stats.max_radii),
            min_radii: visible(&prims.stats.min_radii),
            radii: visible(&render.radii),
            radii_min: visible(&render.radii_min),
            average_grad: percentiles(&prims.average_grads()),
            last_densify: self.density.last_report().cloned(),
        }
    }
}
