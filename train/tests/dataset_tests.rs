use std::path::Path;

use gs_core::{CameraJson, PointCloud};
use gs_rendering::{CpuRasterizer, L1SsimLoss};
use gs_train::io::write_point_cloud_ply;
use gs_train::{CameraLoader, ModelConfig, SceneDataset, TrainConfig, Trainer};
use image::{Rgba, RgbaImage};
use nalgebra::Point3;

/// Writes `count` cameras on a line looking down +z, with half-transparent
/// 8x6 images.
fn write_scene(dir: &Path, count: usize, with_points: bool) {
    let images = dir.join("images");
    std::fs::create_dir_all(&images).unwrap();
    let mut entries = Vec::new();
    for i in 0..count {
        let name = format!("img_{i:02}");
        let mut img = RgbaImage::new(8, 6);
        for (x, _, px) in img.enumerate_pixels_mut() {
            *px = if x < 4 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 0, 0])
            };
        }
        img.save(images.join(format!("{name}.png"))).unwrap();
        entries.push(CameraJson {
            id: i,
            img_name: name,
            width: 8,
            height: 6,
            position: [i as f32 * 0.5 - 2.0, 0.0, -4.0],
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            fx: 8.0,
            fy: 8.0,
            fov_x: None,
            fov_y: None,
        });
    }
    // listed out of order on purpose
    entries.reverse();
    std::fs::write(
        dir.join("cameras.json"),
        serde_json::to_string(&entries).unwrap(),
    )
    .unwrap();

    if with_points {
        let cloud = PointCloud::new(
            (0..27)
                .map(|i| {
                    Point3::new(
                        (i % 3) as f32 * 0.3 - 0.3,
                        (i / 3 % 3) as f32 * 0.3 - 0.3,
                        (i / 9) as f32 * 0.3,
                    )
                })
                .collect(),
        );
        write_point_cloud_ply(&cloud, dir.join("points3d.ply")).unwrap();
    }
}

#[test]
fn test_eval_split_holds_out_every_eighth_camera() {
    let dir = tempfile::tempdir().unwrap();
    write_scene(dir.path(), 10, true);
    let config = ModelConfig {
        eval: true,
        ..ModelConfig::default()
    };

    let dataset = SceneDataset::load(dir.path(), &config, 0).unwrap();
    let test: Vec<&str> = dataset
        .test_entries()
        .iter()
        .map(|e| e.img_name.as_str())
        .collect();
    assert_eq!(test, vec!["img_00", "img_08"]);
    assert_eq!(dataset.train_entries().len(), 8);
    assert_eq!(dataset.point_cloud.len(), 27);
    assert!(dataset.extent > 0.0);
}

#[test]
fn test_images_are_composited_and_downscaled() {
    let dir = tempfile::tempdir().unwrap();
    write_scene(dir.path(), 2, true);
    let config = ModelConfig {
        white_background: true,
        resolution: 2,
        ..ModelConfig::default()
    };
    let dataset = SceneDataset::load(dir.path(), &config, 0).unwrap();

    let cameras = dataset.train_cameras().unwrap();
    let cam = &cameras[0];
    assert_eq!((cam.width, cam.height), (4, 3));
    assert!(cam.mask.is_none());
    // opaque red on the left, white background showing through on the right
    let left = cam.image.pixel(0, 1);
    let right = cam.image.pixel(3, 1);
    assert!((left.x - 1.0).abs() < 1e-3 && left.y.abs() < 1e-3);
    assert!(right.iter().all(|&v| (v - 1.0).abs() < 1e-3));
}

#[test]
fn test_random_backgrounds_per_load() {
    let dir = tempfile::tempdir().unwrap();
    write_scene(dir.path(), 2, true);
    let dataset = SceneDataset::load(dir.path(), &ModelConfig::default(), 0).unwrap();

    let mut loader = dataset.train_loader(true, 11);
    assert_eq!(loader.len(), 2);
    let a = loader.load(0).unwrap();
    let b = loader.load(0).unwrap();
    assert_ne!(a.background, b.background);

    let mut fixed = dataset.train_loader(false, 11);
    assert_eq!(fixed.load(1).unwrap().background, dataset.background());
    assert!(fixed.load(2).is_err());
}

#[test]
fn test_missing_point_cloud_falls_back_to_random_points() {
    let dir = tempfile::tempdir().unwrap();
    write_scene(dir.path(), 3, false);
    let config = ModelConfig {
        random_init_points: 64,
        ..ModelConfig::default()
    };
    let dataset = SceneDataset::load(dir.path(), &config, 5).unwrap();
    assert_eq!(dataset.point_cloud.len(), 64);
}

#[test]
fn test_missing_cameras_json_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(SceneDataset::load(dir.path(), &ModelConfig::default(), 0).is_err());

    std::fs::write(dir.path().join("cameras.json"), "[]").unwrap();
    assert!(matches!(
        SceneDataset::load(dir.path(), &ModelConfig::default(), 0),
        Err(gs_train::Error::EmptyCameraSet(_))
    ));
}

#[test]
fn test_trainer_from_config_prepares_output_folder() {
    let scene = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_scene(scene.path(), 9, true);

    let mut config = TrainConfig::default();
    config.model.source_path = scene.path().to_path_buf();
    config.model.model_path = output.path().join("run");
    config.model.eval = true;
    config.model.sh_degree = 1;
    config.optimization.iterations = 3;
    config.run.test_iterations = vec![3];
    config.run.save_iterations = vec![];

    let mut trainer = Trainer::from_config(
        config,
        Box::new(CpuRasterizer::new(4)),
        Box::new(L1SsimLoss::default()),
    )
    .unwrap();
    let run = output.path().join("run");
    assert!(run.join("cfg_args").is_file());
    assert!(run.join("input.ply").is_file());

    let cameras: Vec<CameraJson> =
        serde_json::from_str(&std::fs::read_to_string(run.join("cameras.json")).unwrap()).unwrap();
    assert_eq!(cameras.len(), 9);
    assert!(cameras.iter().enumerate().all(|(i, c)| c.id == i));

    let summary = trainer.train().unwrap();
    assert_eq!(summary.last_iteration, 3);
    assert!(run.join("point_cloud/iteration_3/point_cloud.ply").is_file());
    assert_eq!(trainer.model().len(), 27);
}
