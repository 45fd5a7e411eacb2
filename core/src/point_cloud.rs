use nalgebra::{Point3, Vector3};

/// Initial point set used to seed the primitives. Colours are linear RGB in `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    pub points: Vec<Point3<f32>>,
    pub colors: Option<Vec<Vector3<f32>>>,
}

impl PointCloud {
    pub fn new(points: Vec<Point3<f32>>) -> Self {
        Self {
            points,
            colors: None,
        }
    }

    pub fn with_colors(mut self, colors: Vec<Vector3<f32>>) -> crate::Result<Self> {
        if colors.len() == self.points.len() {
            self.colors = Some(colors);
            Ok(self)
        } else {
            Err(crate::Error::InvalidInput(format!(
                "Color count {} does not match point count {}",
                colors.len(),
                self.points.len()
            )))
        }
    }

    pub fn color(&self, i: usize) -> Vector3<f32> {
        self.colors
            .as_ref()
            .map(|c| c[i])
            .unwrap_or_else(|| Vector3::new(0.5, 0.5, 0.5))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
