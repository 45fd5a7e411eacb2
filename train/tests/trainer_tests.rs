use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use gs_core::{Camera, Image, ParamGradients, PointCloud, PrimitiveSet};
use gs_rendering::{BackwardOutput, L1SsimLoss, Rasterizer, RenderOutput, RenderSettings};
use gs_train::{
    Checkpoint, GaussianModel, PoolStream, TrainConfig, Trainer, TrainingEvent, TrainingObserver,
    ViewerChannel, ViewerPoll, ViewerRequest,
};
use nalgebra::{Matrix3, Point3, Vector2, Vector3};

/// Paints the background everywhere and reports every primitive as visible
/// with a fixed screen-space gradient.
struct FlatRasterizer {
    screen_grad: f32,
}

impl Rasterizer for FlatRasterizer {
    fn render(
        &self,
        camera: &Camera,
        primitives: &PrimitiveSet,
        _settings: &RenderSettings,
        background: &Vector3<f32>,
    ) -> gs_core::Result<RenderOutput> {
        let n = primitives.len();
        Ok(RenderOutput {
            image: Image::filled(camera.width, camera.height, *background),
            visibility: vec![true; n],
            radii: vec![4.0; n],
            radii_min: vec![2.0; n],
        })
    }

    fn backward(
        &self,
        _camera: &Camera,
        primitives: &PrimitiveSet,
        _settings: &RenderSettings,
        _background: &Vector3<f32>,
        output: &RenderOutput,
        _grad_image: &Image,
    ) -> gs_core::Result<BackwardOutput> {
        let mut params = ParamGradients::zeros_like(primitives);
        params.touched = output.visibility.clone();
        if let Some(positions) = params.positions.as_mut() {
            positions.fill(1e-3);
        }
        Ok(BackwardOutput {
            params,
            screen_space: vec![Vector2::new(self.screen_grad, 0.0); primitives.len()],
        })
    }
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<TrainingEvent>>>);

impl TrainingObserver for Recorder {
    fn notify(&mut self, event: &TrainingEvent) -> gs_train::Result<()> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// A sink whose storage is gone.
struct BrokenSink;

impl TrainingObserver for BrokenSink {
    fn notify(&mut self, _event: &TrainingEvent) -> gs_train::Result<()> {
        Err(gs_train::Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "no space left on device",
        )))
    }
}

#[derive(Default)]
struct ViewerLog {
    sent: usize,
    resets: usize,
}

struct ScriptedViewer {
    script: VecDeque<ViewerPoll>,
    fail_send: bool,
    log: Arc<Mutex<ViewerLog>>,
}

impl ViewerChannel for ScriptedViewer {
    fn poll(&mut self) -> ViewerPoll {
        self.script.pop_front().unwrap_or(ViewerPoll::Idle)
    }

    fn send(&mut self, _image: &Image) -> gs_train::Result<()> {
        if self.fail_send {
            return Err(gs_train::Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "viewer went away",
            )));
        }
        self.log.lock().unwrap().sent += 1;
        Ok(())
    }

    fn reset(&mut self) {
        self.script.clear();
        self.log.lock().unwrap().resets += 1;
    }
}

fn render_request(do_training: bool, keep_alive: bool) -> ViewerPoll {
    ViewerPoll::Render(Box::new(ViewerRequest {
        camera: camera(1),
        scaling_modifier: 1.0,
        do_training,
        keep_alive,
    }))
}

fn camera(i: usize) -> Camera {
    Camera::from_center(
        i,
        format!("cam_{i}"),
        Point3::new(i as f32 - 2.0, 0.0, -4.0),
        Matrix3::identity(),
        0.9,
        0.9,
        Image::filled(12, 12, Vector3::repeat(0.5)),
        None,
        Vector3::zeros(),
    )
    .unwrap()
}

fn config(model_path: &std::path::Path) -> TrainConfig {
    let mut config = TrainConfig::default();
    config.model.model_path = model_path.to_path_buf();
    config.model.sh_degree = 1;
    let opt = &mut config.optimization;
    opt.iterations = 30;
    opt.densify_from_iter = 5;
    opt.densify_until_iter = 25;
    opt.densification_interval = 10;
    opt.opacity_reset_interval = 20;
    opt.sh_increase_interval = 10;
    config.run.test_iterations = vec![];
    config.run.save_iterations = vec![];
    config.run.checkpoint_iterations = vec![20];
    config.run.telemetry = true;
    config.finalize();
    config
}

fn build_trainer(config: TrainConfig, screen_grad: f32) -> Trainer {
    let cloud = PointCloud::new(
        (0..8)
            .map(|i| Point3::new((i % 2) as f32 * 0.2, (i / 2 % 2) as f32 * 0.2, (i / 4) as f32 * 0.2))
            .collect(),
    );
    let model = GaussianModel::from_point_cloud(&cloud, 1, &config.optimization, 2.0).unwrap();
    let cameras = (0..4).map(|i| Arc::new(camera(i))).collect();
    let stream = Box::new(PoolStream::new(cameras, 0).unwrap());
    Trainer::new(
        config,
        model,
        stream,
        2.0,
        Box::new(FlatRasterizer { screen_grad }),
        Box::new(L1SsimLoss::default()),
    )
    .unwrap()
}

#[test]
fn test_full_run_follows_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = build_trainer(config(dir.path()), 1e-3);
    trainer.add_eval_set("train", vec![Arc::new(camera(0))]);
    let recorder = Recorder::default();
    trainer.add_observer(Box::new(recorder.clone()));

    let summary = trainer.train().unwrap();

    assert_eq!(summary.first_iteration, 1);
    assert_eq!(summary.last_iteration, 30);
    assert_eq!(summary.densify_passes, 2);
    assert_eq!(summary.opacity_resets, 1);
    assert_eq!(summary.num_points, trainer.model().len());
    assert!(summary.num_points > 8);
    assert_eq!(trainer.model().active_sh_degree(), 1);
    trainer.model().check_lockstep().unwrap();

    let saved: Vec<String> = summary
        .saved
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    assert_eq!(saved.len(), 2);
    assert!(saved[0].contains("iteration_1"));
    assert!(saved[1].contains("iteration_30"));
    assert!(summary.checkpoints[0].ends_with("chkpnt20.bin"));
    assert!(summary.checkpoints[0].is_file());

    let events = recorder.0.lock().unwrap();
    let iterations = events
        .iter()
        .filter(|e| matches!(e, TrainingEvent::Iteration { .. }))
        .count();
    assert_eq!(iterations, 30);
    assert!(events.iter().any(|e| matches!(
        e,
        TrainingEvent::Evaluation { iteration: 1, split, psnr, .. } if split == "train" && (*psnr - 6.0206).abs() < 1e-3
    )));
    // percentiles are due every 10 densification intervals
    assert!(!events
        .iter()
        .any(|e| matches!(e, TrainingEvent::Percentiles { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, TrainingEvent::OpacityReset { iteration: 20 })));
}

#[test]
fn test_failing_observer_does_not_stop_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = build_trainer(config(dir.path()), 1e-3);
    trainer.add_observer(Box::new(BrokenSink));
    let recorder = Recorder::default();
    trainer.add_observer(Box::new(recorder.clone()));

    let summary = trainer.train().unwrap();
    assert_eq!(summary.last_iteration, 30);
    assert!(summary.checkpoints[0].is_file());
    assert!(dir
        .path()
        .join("point_cloud/iteration_30/point_cloud.ply")
        .is_file());
    let events = recorder.0.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, TrainingEvent::Saved { iteration: 30, .. })));
}

#[test]
fn test_percentile_telemetry_covers_frame_and_model() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.optimization.iterations = 10;
    config.optimization.densification_interval = 1;
    config.run.checkpoint_iterations = vec![];
    let mut trainer = build_trainer(config, 0.0);
    let recorder = Recorder::default();
    trainer.add_observer(Box::new(recorder.clone()));
    trainer.train().unwrap();

    let events = recorder.0.lock().unwrap();
    let Some(TrainingEvent::Percentiles {
        iteration,
        scale_max_div_min,
        scaling_grad,
        radii,
        radii_min,
        scale_median,
        scale_mean,
        ..
    }) = events
        .iter()
        .find(|e| matches!(e, TrainingEvent::Percentiles { .. }))
    else {
        panic!("no percentile event");
    };
    assert_eq!(*iteration, 10);
    assert!(radii.iter().all(|&r| r == 4.0));
    assert!(radii_min.iter().all(|&r| r == 2.0));
    assert!(scaling_grad.iter().all(|&g| g == 0.0));
    // isotropic initial scales
    assert!(scale_max_div_min.iter().all(|&r| (r - 1.0).abs() < 1e-4));
    assert!(scale_median
        .iter()
        .zip(scale_mean)
        .all(|(m, a)| (m - a).abs() < 1e-6));
}

#[test]
fn test_low_gradients_leave_cardinality_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = build_trainer(config(dir.path()), 0.0);
    let summary = trainer.train().unwrap();
    assert_eq!(summary.num_points, 8);
    assert_eq!(summary.densify_passes, 2);
}

#[test]
fn test_resume_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = build_trainer(config(dir.path()), 1e-3);
    first.train().unwrap();

    let checkpoint = Checkpoint::load(dir.path().join("chkpnt20.bin")).unwrap();
    let points_at_20 = checkpoint.model.primitives.len();
    let mut resumed = build_trainer(config(dir.path()), 1e-3);
    resumed.resume(checkpoint).unwrap();
    assert_eq!(resumed.start_iteration(), 20);
    assert_eq!(resumed.model().len(), points_at_20);

    let summary = resumed.train().unwrap();
    assert_eq!(summary.first_iteration, 21);
    assert_eq!(summary.last_iteration, 30);
    assert!(summary.saved[0].display().to_string().contains("iteration_21"));
    // iteration 20 was the last densification pass before the resume point
    assert_eq!(summary.densify_passes, 0);
}

#[test]
fn test_viewer_failure_resets_channel_and_training_continues() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = build_trainer(config(dir.path()), 1e-3);
    let log = Arc::new(Mutex::new(ViewerLog::default()));
    let request = |do_training| render_request(do_training, false);
    trainer.set_viewer(Box::new(ScriptedViewer {
        script: VecDeque::from(vec![request(false), request(true), request(true)]),
        fail_send: false,
        log: Arc::clone(&log),
    }));
    trainer.train().unwrap();
    {
        let log = log.lock().unwrap();
        // two answered before the first iteration, one before the second
        assert_eq!(log.sent, 3);
        assert_eq!(log.resets, 0);
    }

    let dir = tempfile::tempdir().unwrap();
    let mut trainer = build_trainer(config(dir.path()), 1e-3);
    let log = Arc::new(Mutex::new(ViewerLog::default()));
    trainer.set_viewer(Box::new(ScriptedViewer {
        script: VecDeque::from(vec![request(true), ViewerPoll::Disconnected]),
        fail_send: true,
        log: Arc::clone(&log),
    }));
    let summary = trainer.train().unwrap();
    assert_eq!(summary.last_iteration, 30);
    let log = log.lock().unwrap();
    assert_eq!(log.sent, 0);
    assert_eq!(log.resets, 1);
}

#[test]
fn test_keep_alive_viewer_holds_last_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.optimization.iterations = 3;
    config.run.checkpoint_iterations = vec![];
    let mut trainer = build_trainer(config, 1e-3);
    let log = Arc::new(Mutex::new(ViewerLog::default()));
    trainer.set_viewer(Box::new(ScriptedViewer {
        script: VecDeque::from(vec![
            // iteration 1: keep_alive only matters on the last iteration
            render_request(true, true),
            ViewerPoll::Idle,
            // iteration 3: served through idle polls until the viewer leaves
            render_request(true, true),
            render_request(true, true),
            ViewerPoll::Idle,
            ViewerPoll::Idle,
            render_request(true, true),
            ViewerPoll::Disconnected,
        ]),
        fail_send: false,
        log: Arc::clone(&log),
    }));

    let summary = trainer.train().unwrap();
    assert_eq!(summary.last_iteration, 3);
    let log = log.lock().unwrap();
    assert_eq!(log.sent, 4);
    assert_eq!(log.resets, 1);
}

#[test]
fn test_viewer_without_keep_alive_releases_last_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.optimization.iterations = 2;
    config.run.checkpoint_iterations = vec![];
    let mut trainer = build_trainer(config, 1e-3);
    let log = Arc::new(Mutex::new(ViewerLog::default()));
    trainer.set_viewer(Box::new(ScriptedViewer {
        script: VecDeque::from(vec![
            ViewerPoll::Idle,
            render_request(true, false),
            render_request(true, false),
        ]),
        fail_send: false,
        log: Arc::clone(&log),
    }));

    trainer.train().unwrap();
    let log = log.lock().unwrap();
    // the second request is never polled
    assert_eq!(log.sent, 1);
    assert_eq!(log.resets, 0);
}
