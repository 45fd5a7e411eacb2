use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::image::Image;

pub fn fov_to_focal(fov: f32, pixels: u32) -> f32 {
    pixels as f32 / (2.0 * (fov / 2.0).tan())
}

pub fn focal_to_fov(focal: f32, pixels: u32) -> f32 {
    2.0 * (pixels as f32 / (2.0 * focal)).atan()
}

/// A training view. Immutable once constructed.
///
/// `rotation` and `translation` map world points into the camera frame
/// (`p_view = R * p_world + t`), with +z looking forward.
#[derive(Debug, Clone)]
pub struct Camera {
    pub uid: usize,
    pub image_name: String,
    pub rotation: Matrix3<f32>,
    pub translation: Vector3<f32>,
    pub fov_x: f32,
    pub fov_y: f32,
    pub width: u32,
    pub height: u32,
    pub image: Image,
    pub mask: Option<Image>,
    pub background: Vector3<f32>,
}

impl Camera {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uid: usize,
        image_name: impl Into<String>,
        rotation: Matrix3<f32>,
        translation: Vector3<f32>,
        fov_x: f32,
        fov_y: f32,
        mut image: Image,
        mask: Option<Image>,
        background: Vector3<f32>,
    ) -> crate::Result<Self> {
        if image.channels != 3 {
            return Err(crate::Error::InvalidInput(format!(
                "camera target must be RGB, got {} channels",
                image.channels
            )));
        }
        if image.width == 0 || image.height == 0 {
            return Err(crate::Error::InvalidInput("camera target image is empty".into()));
        }
        if !(fov_x > 0.0 && fov_y > 0.0) {
            return Err(crate::Error::InvalidInput(format!(
                "invalid field of view ({fov_x}, {fov_y})"
            )));
        }
        if let Some(mask) = &mask {
            image.apply_mask(mask)?;
        }
        Ok(Self {
            uid,
            image_name: image_name.into(),
            rotation,
            translation,
            fov_x,
            fov_y,
            width: image.width,
            height: image.height,
            image,
            mask,
            background,
        })
    }

    /// Builds a camera from its world position and camera-to-world rotation.
    #[allow(clippy::too_many_arguments)]
    pub fn from_center(
        uid: usize,
        image_name: impl Into<String>,
        center: Point3<f32>,
        cam_to_world: Matrix3<f32>,
        fov_x: f32,
        fov_y: f32,
        image: Image,
        mask: Option<Image>,
        background: Vector3<f32>,
    ) -> crate::Result<Self> {
        let rotation = cam_to_world.transpose();
        let translation = -(rotation * center.coords);
        Self::new(
            uid,
            image_name,
            rotation,
            translation,
            fov_x,
            fov_y,
            image,
            mask,
            background,
        )
    }

    pub fn focal_x(&self) -> f32 {
        fov_to_focal(self.fov_x, self.width)
    }

    pub fn focal_y(&self) -> f32 {
        fov_to_focal(self.fov_y, self.height)
    }

    /// Camera centre in world coordinates.
    pub fn center(&self) -> Point3<f32> {
        Point3::from(-(self.rotation.transpose() * self.translation))
    }

    pub fn world_to_view(&self, p: &Vector3<f32>) -> Vector3<f32> {
        self.rotation * p + self.translation
    }

    pub fn to_json(&self, id: usize) -> CameraJson {
        let c2w = self.rotation.transpose();
        let center = self.center();
        CameraJson {
            id,
            img_name: self.image_name.clone(),
            width: self.width,
            height: self.height,
            position: [center.x, center.y, center.z],
            rotation: [
                [c2w[(0, 0)], c2w[(0, 1)], c2w[(0, 2)]],
                [c2w[(1, 0)], c2w[(1, 1)], c2w[(1, 2)]],
                [c2w[(2, 0)], c2w[(2, 1)], c2w[(2, 2)]],
            ],
            fx: self.focal_x(),
            fy: self.focal_y(),
            fov_x: Some(self.fov_x),
            fov_y: Some(self.fov_y),
        }
    }
}

/// Per-camera descriptor written to `cameras.json` and read back by the dataset loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraJson {
    pub id: usize,
    pub img_name: String,
    pub width: u32,
    pub height: u32,
    pub position: [f32; 3],
    /// Camera-to-world rotation, row major.
    pub rotation: [[f32; 3]; 3],
    pub fx: f32,
    pub fy: f32,
    #[serde(rename = "FovX", default, skip_serializing_if = "Option::is_none")]
    pub fov_x: Option<f32>,
    #[serde(rename = "FovY", default, skip_serializing_if = "Option::is_none")]
    pub fov_y: Option<f32>,
}

impl CameraJson {
    pub fn cam_to_world(&self) -> Matrix3<f32> {
        let r = &self.rotation;
        Matrix3::new(
            r[0][0], r[0][1], r[0][2], r[1][0], r[1][1], r[1][2], r[2][0], r[2][1], r[2][2],
        )
    }

    pub fn center(&self) -> Point3<f32> {
        Point3::new(self.position[0], self.position[1], self.position[2])
    }
}

/// Radius of the sphere enclosing all camera centres, padded by 10%.
///
/// Used to normalise world-space size thresholds and the position learning rate.
pub fn scene_extent(cameras: &[Camera]) -> f32 {
    let centers: Vec<Point3<f32>> = cameras.iter().map(|c| c.center()).collect();
    extent_of_centers(&centers)
}

pub fn extent_of_centers(centers: &[Point3<f32>]) -> f32 {
    if centers.is_empty() {
        return 0.0;
    }
    let mut mean = Vector3::zeros();
    for c in centers {
        mean += c.coords;
    }
    mean /= centers.len() as f32;
    let diagonal = centers
        .iter()
        .map(|c| (c.coords - mean).norm())
        .fold(0.0f32, f32::max);
    diagonal * 1.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fov_focal_inverse() {
        let focal = fov_to_focal(0.8, 640);
        assert!((focal_to_fov(focal, 640) - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_extent_of_two_centers() {
        let centers = vec![Point3::new(-1.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        assert!((extent_of_centers(&centers) - 1.1).abs() < 1e-6);
        assert_eq!(extent_of_centers(&[]), 0.0);
    }
}
