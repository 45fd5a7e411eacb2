//! Scene loading.
//!
//! A scene directory holds:
//! - `cameras.json`: one entry per view (see [`gs_core::CameraJson`])
//! - `images/<img_name>`: the photographs, extension optional
//! - `points3d.ply` (optional): the initial point cloud
//!
//! Cameras are only decoded when asked for, so the same dataset serves both
//! the preloaded and the streamed sampling policies.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gs_core::{extent_of_centers, focal_to_fov, Camera, CameraJson, Image, PointCloud};
use image::imageops::FilterType;
use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::camera_stream::CameraLoader;
use crate::config::ModelConfig;
use crate::{Error, Result};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Decodes camera entries into [`Camera`]s.
#[derive(Debug, Clone)]
struct CameraDecoder {
    images_dir: PathBuf,
    resolution: u32,
}

impl CameraDecoder {
    fn image_path(&self, name: &str) -> Result<PathBuf> {
        let direct = self.images_dir.join(name);
        if direct.is_file() {
            return Ok(direct);
        }
        IMAGE_EXTENSIONS
            .iter()
            .map(|ext| self.images_dir.join(format!("{name}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                Error::Dataset(format!(
                    "no image for camera '{name}' in {}",
                    self.images_dir.display()
                ))
            })
    }

    fn decode(&self, entry: &CameraJson, background: Vector3<f32>) -> Result<Camera> {
        let path = self.image_path(&entry.img_name)?;
        let mut img = image::open(&path).map_err(gs_core::Error::from)?;
        if self.resolution > 1 {
            let width = (img.width() / self.resolution).max(1);
            let height = (img.height() / self.resolution).max(1);
            img = img.resize_exact(width, height, FilterType::Triangle);
        }
        let target = Image::from_dynamic(&img, background);

        let fov_x = entry.fov_x.unwrap_or_else(|| focal_to_fov(entry.fx, entry.width));
        let fov_y = entry.fov_y.unwrap_or_else(|| focal_to_fov(entry.fy, entry.height));
        Ok(Camera::from_center(
            entry.id,
            entry.img_name.clone(),
            entry.center(),
            entry.cam_to_world(),
            fov_x,
            fov_y,
            target,
            None,
            background,
        )?)
    }
}

#[derive(Debug, Clone)]
pub struct SceneDataset {
    pub source: PathBuf,
    pub point_cloud: PointCloud,
    /// Radius of the training camera centres, padded by 10%.
    pub extent: f32,
    train: Vec<CameraJson>,
    test: Vec<CameraJson>,
    decoder: CameraDecoder,
    background: Vector3<f32>,
}

impl SceneDataset {
    pub fn load(source: impl AsRef<Path>, config: &ModelConfig, seed: u64) -> Result<Self> {
        let source = source.as_ref().to_path_buf();
        let cameras_path = source.join("cameras.json");
        let file = File::open(&cameras_path).map_err(|e| {
            Error::Dataset(format!("cannot open {}: {e}", cameras_path.display()))
        })?;
        let mut entries: Vec<CameraJson> = serde_json::from_reader(BufReader::new(file))?;
        if entries.is_empty() {
            return Err(Error::EmptyCameraSet(format!(
                "{} lists no cameras",
                cameras_path.display()
            )));
        }
        entries.sort_by(|a, b| a.img_name.cmp(&b.img_name));

        let (train, test): (Vec<_>, Vec<_>) = if config.eval && config.llffhold > 0 {
            let (test, train): (Vec<_>, Vec<_>) = entries
                .into_iter()
                .enumerate()
                .partition(|(i, _)| i % config.llffhold == 0);
            (
                train.into_iter().map(|(_, e)| e).collect(),
                test.into_iter().map(|(_, e)| e).collect(),
            )
        } else {
            (entries, Vec::new())
        };
        if train.is_empty() {
            return Err(Error::EmptyCameraSet("every camera was held out for testing".into()));
        }

        let centers: Vec<Point3<f32>> = train.iter().map(CameraJson::center).collect();
        let extent = extent_of_centers(&centers);

        let ply_path = source.join("points3d.ply");
        let point_cloud = if ply_path.is_file() {
            crate::io::read_point_cloud_ply(&ply_path)?
        } else {
            tracing::info!(
                "No points3d.ply in {}, generating {} random points",
                source.display(),
                config.random_init_points
            );
            random_point_cloud(config.random_init_points, seed)
        };
        if point_cloud.is_empty() {
            return Err(Error::Dataset("initial point cloud is empty".into()));
        }

        let background = if config.white_background {
            Vector3::repeat(1.0)
        } else {
            Vector3::zeros()
        };

        tracing::info!(
            "Loaded {} training and {} test cameras, {} initial points, extent {:.3}",
            train.len(),
            test.len(),
            point_cloud.len(),
            extent
        );

        Ok(Self {
            decoder: CameraDecoder {
                images_dir: source.join(&config.images),
                resolution: config.resolution.max(1),
            },
            source,
            point_cloud,
            extent,
            train,
            test,
            background,
        })
    }

    pub fn background(&self) -> Vector3<f32> {
        self.background
    }

    pub fn train_entries(&self) -> &[CameraJson] {
        &self.train
    }

    pub fn test_entries(&self) -> &[CameraJson] {
        &self.test
    }

    pub fn train_cameras(&self) -> Result<Vec<Arc<Camera>>> {
        self.decode_all(&self.train)
    }

    pub fn test_cameras(&self) -> Result<Vec<Arc<Camera>>> {
        self.decode_all(&self.test)
    }

    fn decode_all(&self, entries: &[CameraJson]) -> Result<Vec<Arc<Camera>>> {
        entries
            .iter()
            .map(|e| self.decoder.decode(e, self.background).map(Arc::new))
            .collect()
    }

    /// Lazy loader over the training cameras. With `random_background` every
    /// load composites onto a fresh random colour.
    pub fn train_loader(&self, random_background: bool, seed: u64) -> DatasetLoader {
        DatasetLoader {
            entries: self.train.clone(),
            decoder: self.decoder.clone(),
            background: self.background,
            random_background,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

pub struct DatasetLoader {
    entries: Vec<CameraJson>,
    decoder: CameraDecoder,
    background: Vector3<f32>,
    random_background: bool,
    rng: StdRng,
}

impl CameraLoader for DatasetLoader {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn load(&mut self, index: usize) -> Result<Arc<Camera>> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::Dataset(format!("camera index {index} out of range")))?;
        let background = if self.random_background {
            Vector3::new(self.rng.gen(), self.rng.gen(), self.rng.gen())
        } else {
            self.background
        };
        self.decoder.decode(entry, background).map(Arc::new)
    }
}

/// Uniform points in `[-1.3, 1.3]^3` with random colours.
pub fn random_point_cloud(count: usize, seed: u64) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    let points = (0..count)
        .map(|_| {
            Point3::new(
                rng.gen_range(-1.3..1.3),
                rng.gen_range(-1.3..1.3),
                rng.gen_range(-1.3..1.3),
            )
        })
        .collect();
    let colors = (0..count)
        .map(|_| Vector3::new(rng.gen(), rng.gen(), rng.gen()))
        .collect();
    PointCloud {
        points,
        colors: Some(colors),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_cloud_is_bounded_and_seeded() {
        let a = random_point_cloud(50, 3);
        let b = random_point_cloud(50, 3);
        assert_eq!(a.points, b.points);
        assert!(a
            .points
            .iter()
            .all(|p| p.coords.iter().all(|v| (-1.3..1.3).contains(v))));
        assert_eq!(a.colors.as_ref().map(Vec::len), Some(50));
    }
}
