//! Core types for Gaussian Splatting
//!
//! The scene is a table of anisotropic Gaussians stored structure-of-arrays:
//! one [`ParamBuffer`] per parameter group, all with the same row count.
//! Raw parameters are stored unconstrained (log scale, opacity logit, an
//! unnormalised quaternion) and the derived values are recomputed on demand,
//! so gradients always flow through the raw values.
//!
//! ## Example
//!
//! ```rust
//! use gs_core::{PointCloud, PrimitiveSet};
//! use nalgebra::{Point3, Vector3};
//!
//! let cloud = PointCloud::new(vec![
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(1.0, 0.0, 0.0),
//!     Point3::new(0.0, 1.0, 0.0),
//!     Point3::new(0.0, 0.0, 1.0),
//! ])
//! .with_colors(vec![Vector3::new(0.8, 0.5, 0.3); 4])
//! .unwrap();
//!
//! let set = PrimitiveSet::from_point_cloud(&cloud, 3).unwrap();
//! assert_eq!(set.len(), 4);
//! assert!((set.opacity(0) - 0.1).abs() < 1e-6);
//! ```

use nalgebra::{Matrix3, Point3, Vector3, Vector4};
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::point_cloud::PointCloud;
use crate::rows::RowMapping;

/// Zeroth-order real spherical harmonic constant.
pub const SH_C0: f32 = 0.282_094_8;

/// Number of SH basis functions per colour channel for `degree`.
pub fn sh_coeff_count(degree: usize) -> usize {
    (degree + 1) * (degree + 1)
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn inverse_sigmoid(y: f32) -> f32 {
    (y / (1.0 - y)).ln()
}

/// Rotation matrix of the quaternion `(w, x, y, z)`, normalised first.
pub fn quat_to_matrix(q: &Vector4<f32>) -> Matrix3<f32> {
    let n = q.norm();
    let q = if n > 0.0 { q / n } else { Vector4::new(1.0, 0.0, 0.0, 0.0) };
    let (w, x, y, z) = (q[0], q[1], q[2], q[3]);

    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamGroup {
    Position,
    FeaturesDc,
    FeaturesRest,
    Opacity,
    Scaling,
    Rotation,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 6] = [
        ParamGroup::Position,
        ParamGroup::FeaturesDc,
        ParamGroup::FeaturesRest,
        ParamGroup::Opacity,
        ParamGroup::Scaling,
        ParamGroup::Rotation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ParamGroup::Position => "xyz",
            ParamGroup::FeaturesDc => "f_dc",
            ParamGroup::FeaturesRest => "f_rest",
            ParamGroup::Opacity => "opacity",
            ParamGroup::Scaling => "scaling",
            ParamGroup::Rotation => "rotation",
        }
    }
}

/// A dense `rows x width` block of `f32`, row major.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamBuffer {
    width: usize,
    rows: usize,
    data: Vec<f32>,
}

impl ParamBuffer {
    pub fn zeros(rows: usize, width: usize) -> Self {
        Self {
            width,
            rows,
            data: vec![0.0; rows * width],
        }
    }

    /// Wraps row-major data. `width` must be non-zero.
    pub fn from_vec(width: usize, data: Vec<f32>) -> Self {
        debug_assert!(width > 0 && data.len() % width == 0);
        let rows = if width == 0 { 0 } else { data.len() / width };
        Self { width, rows, data }
    }

    /// Wraps row-major data with an explicit row count, which also covers zero-width groups.
    pub fn from_rows(rows: usize, width: usize, data: Vec<f32>) -> crate::Result<Self> {
        if data.len() != rows * width {
            return Err(crate::Error::DimensionMismatch(format!(
                "{rows}x{width} buffer needs {} values, got {}",
                rows * width,
                data.len()
            )));
        }
        Ok(Self { width, rows, data })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.width..(i + 1) * self.width]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.width..(i + 1) * self.width]
    }

    pub fn push_row(&mut self, values: &[f32]) {
        debug_assert_eq!(values.len(), self.width);
        self.data.extend_from_slice(values);
        self.rows += 1;
    }

    pub fn vec3(&self, i: usize) -> Vector3<f32> {
        let r = self.row(i);
        Vector3::new(r[0], r[1], r[2])
    }

    pub fn vec4(&self, i: usize) -> Vector4<f32> {
        let r = self.row(i);
        Vector4::new(r[0], r[1], r[2], r[3])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }
}

/// One Gaussian, as a value. Used to derive new rows during densification.
#[derive(Clone, Debug, PartialEq)]
pub struct Primitive {
    pub position: Vector3<f32>,
    pub features_dc: Vector3<f32>,
    pub features_rest: Vec<f32>,
    pub opacity_logit: f32,
    pub log_scale: Vector3<f32>,
    pub rotation: Vector4<f32>,
}

impl Primitive {
    pub fn scale(&self) -> Vector3<f32> {
        self.log_scale.map(f32::exp)
    }

    pub fn opacity(&self) -> f32 {
        sigmoid(self.opacity_logit)
    }

    pub fn rotation_matrix(&self) -> Matrix3<f32> {
        quat_to_matrix(&self.rotation)
    }
}

/// Screen-space statistics gathered between densification passes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DensityStats {
    pub max_radii: Vec<f32>,
    /// 0 means not observed since the last reset.
    pub min_radii: Vec<f32>,
    pub grad_accum: Vec<f32>,
    pub grad_count: Vec<f32>,
}

impl DensityStats {
    fn zeros(rows: usize) -> Self {
        Self {
            max_radii: vec![0.0; rows],
            min_radii: vec![0.0; rows],
            grad_accum: vec![0.0; rows],
            grad_count: vec![0.0; rows],
        }
    }

    fn remap(&self, mapping: &RowMapping) -> crate::Result<Self> {
        Ok(Self {
            max_radii: mapping.apply_vec(&self.max_radii, 0.0)?,
            min_radii: mapping.apply_vec(&self.min_radii, 0.0)?,
            grad_accum: mapping.apply_vec(&self.grad_accum, 0.0)?,
            grad_count: mapping.apply_vec(&self.grad_count, 0.0)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatField {
    MaxRadii,
    MinRadii,
    GradAccum,
    GradCount,
    All,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveSet {
    max_sh_degree: usize,
    positions: ParamBuffer,
    features_dc: ParamBuffer,
    features_rest: ParamBuffer,
    opacities: ParamBuffer,
    scalings: ParamBuffer,
    rotations: ParamBuffer,
    pub stats: DensityStats,
}

impl PrimitiveSet {
    pub fn new(max_sh_degree: usize) -> Self {
        Self {
            max_sh_degree,
            positions: ParamBuffer::zeros(0, 3),
            features_dc: ParamBuffer::zeros(0, 3),
            features_rest: ParamBuffer::zeros(0, Self::rest_width(max_sh_degree)),
            opacities: ParamBuffer::zeros(0, 1),
            scalings: ParamBuffer::zeros(0, 3),
            rotations: ParamBuffer::zeros(0, 4),
            stats: DensityStats::default(),
        }
    }

    fn rest_width(max_sh_degree: usize) -> usize {
        3 * (sh_coeff_count(max_sh_degree) - 1)
    }

    /// Seeds one primitive per point: SH DC from the point colour, isotropic
    /// scale from the mean squared distance to the 3 nearest neighbours,
    /// identity rotation and opacity 0.1.
    pub fn from_point_cloud(cloud: &PointCloud, max_sh_degree: usize) -> crate::Result<Self> {
        if cloud.is_empty() {
            return Err(crate::Error::InvalidInput(
                "cannot initialise primitives from an empty point cloud".into(),
            ));
        }

        let dist2 = mean_knn_dist2(&cloud.points, 3);
        let mut set = Self::new(max_sh_degree);
        let rest = vec![0.0; Self::rest_width(max_sh_degree)];
        let opacity_logit = inverse_sigmoid(0.1);

        for (i, p) in cloud.points.iter().enumerate() {
            let log_scale = dist2[i].max(1e-7).sqrt().ln();
            set.push(Primitive {
                position: p.coords,
                features_dc: rgb_to_sh(cloud.color(i)),
                features_rest: rest.clone(),
                opacity_logit,
                log_scale: Vector3::repeat(log_scale),
                rotation: Vector4::new(1.0, 0.0, 0.0, 0.0),
            });
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.positions.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_sh_degree(&self) -> usize {
        self.max_sh_degree
    }

    pub fn group(&self, group: ParamGroup) -> &ParamBuffer {
        match group {
            ParamGroup::Position => &self.positions,
            ParamGroup::FeaturesDc => &self.features_dc,
            ParamGroup::FeaturesRest => &self.features_rest,
            ParamGroup::Opacity => &self.opacities,
            ParamGroup::Scaling => &self.scalings,
            ParamGroup::Rotation => &self.rotations,
        }
    }

    pub fn group_mut(&mut self, group: ParamGroup) -> &mut ParamBuffer {
        match group {
            ParamGroup::Position => &mut self.positions,
            ParamGroup::FeaturesDc => &mut self.features_dc,
            ParamGroup::FeaturesRest => &mut self.features_rest,
            ParamGroup::Opacity => &mut self.opacities,
            ParamGroup::Scaling => &mut self.scalings,
            ParamGroup::Rotation => &mut self.rotations,
        }
    }

    /// Appends one row. Statistics for the row start at zero.
    pub fn push(&mut self, p: Primitive) {
        debug_assert_eq!(p.features_rest.len(), self.features_rest.width());
        self.positions.push_row(p.position.as_slice());
        self.features_dc.push_row(p.features_dc.as_slice());
        self.features_rest.push_row(&p.features_rest);
        self.opacities.push_row(&[p.opacity_logit]);
        self.scalings.push_row(p.log_scale.as_slice());
        self.rotations.push_row(p.rotation.as_slice());
        self.stats.max_radii.push(0.0);
        self.stats.min_radii.push(0.0);
        self.stats.grad_accum.push(0.0);
        self.stats.grad_count.push(0.0);
    }

    pub fn primitive(&self, i: usize) -> Primitive {
        Primitive {
            position: self.positions.vec3(i),
            features_dc: self.features_dc.vec3(i),
            features_rest: self.features_rest.row(i).to_vec(),
            opacity_logit: self.opacities.row(i)[0],
            log_scale: self.scalings.vec3(i),
            rotation: self.rotations.vec4(i),
        }
    }

    pub fn position(&self, i: usize) -> Vector3<f32> {
        self.positions.vec3(i)
    }

    pub fn scale(&self, i: usize) -> Vector3<f32> {
        self.scalings.vec3(i).map(f32::exp)
    }

    pub fn scales(&self) -> Vec<Vector3<f32>> {
        (0..self.len()).map(|i| self.scale(i)).collect()
    }

    pub fn max_scale(&self, i: usize) -> f32 {
        self.scale(i).max()
    }

    pub fn opacity_logit(&self, i: usize) -> f32 {
        self.opacities.row(i)[0]
    }

    pub fn opacity(&self, i: usize) -> f32 {
        sigmoid(self.opacity_logit(i))
    }

    pub fn opacities(&self) -> Vec<f32> {
        (0..self.len()).map(|i| self.opacity(i)).collect()
    }

    /// Forces every opacity so that `sigmoid(logit) == value`.
    pub fn set_all_opacities(&mut self, value: f32) {
        self.opacities.fill(inverse_sigmoid(value));
    }

    /// Normalised `(w, x, y, z)` quaternion.
    pub fn rotation(&self, i: usize) -> Vector4<f32> {
        let q = self.rotations.vec4(i);
        let n = q.norm();
        if n > 0.0 {
            q / n
        } else {
            Vector4::new(1.0, 0.0, 0.0, 0.0)
        }
    }

    pub fn rotation_matrix(&self, i: usize) -> Matrix3<f32> {
        quat_to_matrix(&self.rotations.vec4(i))
    }

    /// World-space covariance `R S S^T R^T`.
    pub fn covariance(&self, i: usize, scaling_modifier: f32) -> Matrix3<f32> {
        let r = self.rotation_matrix(i);
        let s = Matrix3::from_diagonal(&(self.scale(i) * scaling_modifier));
        let m = r * s;
        m * m.transpose()
    }

    /// Mean accumulated screen-space gradient per row; 0 for rows never observed.
    pub fn average_grads(&self) -> Vec<f32> {
        self.stats
            .grad_accum
            .iter()
            .zip(&self.stats.grad_count)
            .map(|(&acc, &n)| if n > 0.0 { acc / n } else { 0.0 })
            .collect()
    }

    pub fn reset_stat(&mut self, field: StatField) {
        let stats = &mut self.stats;
        match field {
            StatField::MaxRadii => stats.max_radii.fill(0.0),
            StatField::MinRadii => stats.min_radii.fill(0.0),
            StatField::GradAccum => stats.grad_accum.fill(0.0),
            StatField::GradCount => stats.grad_count.fill(0.0),
            StatField::All => {
                stats.max_radii.fill(0.0);
                stats.min_radii.fill(0.0);
                stats.grad_accum.fill(0.0);
                stats.grad_count.fill(0.0);
            }
        }
    }

    /// Derives new rows from each selected row and appends them.
    ///
    /// The returned mapping keeps every existing row and marks the appended
    /// ones as synthetic. It must be forwarded to the optimizer.
    #[must_use = "the row mapping has to be applied to the optimizer state"]
    pub fn append_from<F>(&mut self, indices: &[usize], mut derive: F) -> RowMapping
    where
        F: FnMut(&Primitive) -> Vec<Primitive>,
    {
        let old_len = self.len();
        let derived: Vec<Primitive> = indices
            .iter()
            .flat_map(|&i| derive(&self.primitive(i)))
            .collect();
        let added = derived.len();
        for p in derived {
            self.push(p);
        }
        RowMapping::append(old_len, added)
    }

    /// Compacts every buffer, keeping the rows where `predicate` is false.
    /// On error the set is left as it was.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> crate::Result<RowMapping>
    where
        F: FnMut(usize) -> bool,
    {
        let keep: Vec<bool> = (0..self.len()).map(|i| !predicate(i)).collect();
        let mapping = RowMapping::retain(&keep);
        if !mapping.is_identity() {
            self.apply_mapping(&mapping)?;
        }
        Ok(mapping)
    }

    /// Reindexes every buffer through a mapping. Synthetic rows are zeroed,
    /// so this is only meant for mappings that only drop or reorder rows.
    /// Nothing is written unless every column remaps.
    pub fn apply_mapping(&mut self, mapping: &RowMapping) -> crate::Result<()> {
        if mapping.old_len() != self.len() {
            return Err(crate::Error::InvariantViolation(format!(
                "mapping expects {} rows, primitive set has {}",
                mapping.old_len(),
                self.len()
            )));
        }
        let groups = ParamGroup::ALL
            .iter()
            .map(|&group| mapping.apply(self.group(group)))
            .collect::<crate::Result<Vec<_>>>()?;
        let stats = self.stats.remap(mapping)?;
        for (group, remapped) in ParamGroup::ALL.iter().zip(groups) {
            *self.group_mut(*group) = remapped;
        }
        self.stats = stats;
        Ok(())
    }

    /// Checks that all parameter and statistic columns share one row count.
    pub fn validate(&self) -> crate::Result<()> {
        let n = self.len();
        for group in ParamGroup::ALL {
            let rows = self.group(group).rows();
            if rows != n {
                return Err(crate::Error::InvariantViolation(format!(
                    "group {} has {} rows, expected {}",
                    group.name(),
                    rows,
                    n
                )));
            }
        }
        let s = &self.stats;
        for (name, len) in [
            ("max_radii", s.max_radii.len()),
            ("min_radii", s.min_radii.len()),
            ("grad_accum", s.grad_accum.len()),
            ("grad_count", s.grad_count.len()),
        ] {
            if len != n {
                return Err(crate::Error::InvariantViolation(format!(
                    "statistic {name} has {len} rows, expected {n}"
                )));
            }
        }
        Ok(())
    }
}

pub fn rgb_to_sh(rgb: Vector3<f32>) -> Vector3<f32> {
    (rgb - Vector3::repeat(0.5)) / SH_C0
}

pub fn sh_to_rgb(sh: Vector3<f32>) -> Vector3<f32> {
    sh * SH_C0 + Vector3::repeat(0.5)
}

struct IndexedPoint(usize, [f32; 3]);

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f32; 3]>;
    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.1)
    }
}

impl rstar::PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f32; 3]) -> f32 {
        let dx = self.1[0] - point[0];
        let dy = self.1[1] - point[1];
        let dz = self.1[2] - point[2];
        dx * dx + dy * dy + dz * dz
    }
}

fn mean_knn_dist2(points: &[Point3<f32>], k: usize) -> Vec<f32> {
    let tree = RTree::bulk_load(
        points
            .iter()
            .enumerate()
            .map(|(i, p)| IndexedPoint(i, [p.x, p.y, p.z]))
            .collect(),
    );

    points
        .par_iter()
        .enumerate()
        .map(|(i, p)| {
            let q = [p.x, p.y, p.z];
            let neighbours: Vec<f32> = tree
                .nearest_neighbor_iter_with_distance_2(&q)
                .filter(|(n, _)| n.0 != i)
                .take(k)
                .map(|(_, d2)| d2)
                .collect();
            if neighbours.is_empty() {
                0.0
            } else {
                neighbours.iter().sum::<f32>() / neighbours.len() as f32
            }
        })
        .collect()
}

/// Per-group gradients for one iteration, in lockstep with [`PrimitiveSet`] rows.
///
/// A group set to `None` received no gradient and must not be stepped.
/// Rows whose `touched` flag is false were not observed and keep their state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamGradients {
    pub positions: Option<ParamBuffer>,
    pub features_dc: Option<ParamBuffer>,
    pub features_rest: Option<ParamBuffer>,
    pub opacities: Option<ParamBuffer>,
    pub scalings: Option<ParamBuffer>,
    pub rotations: Option<ParamBuffer>,
    pub touched: Vec<bool>,
}

impl ParamGradients {
    /// Zeroed gradients for every group of `set`.
    pub fn zeros_like(set: &PrimitiveSet) -> Self {
        let n = set.len();
        let mut grads = Self {
            touched: vec![false; n],
            ..Self::default()
        };
        for group in ParamGroup::ALL {
            grads.set(group, Some(ParamBuffer::zeros(n, set.group(group).width())));
        }
        grads
    }

    pub fn rows(&self) -> usize {
        self.touched.len()
    }

    pub fn group(&self, group: ParamGroup) -> Option<&ParamBuffer> {
        match group {
            ParamGroup::Position => self.positions.as_ref(),
            ParamGroup::FeaturesDc => self.features_dc.as_ref(),
            ParamGroup::FeaturesRest => self.features_rest.as_ref(),
            ParamGroup::Opacity => self.opacities.as_ref(),
            ParamGroup::Scaling => self.scalings.as_ref(),
            ParamGroup::Rotation => self.rotations.as_ref(),
        }
    }

    pub fn group_mut(&mut self, group: ParamGroup) -> Option<&mut ParamBuffer> {
        self.slot(group).as_mut()
    }

    pub fn set(&mut self, group: ParamGroup, grad: Option<ParamBuffer>) {
        *self.slot(group) = grad;
    }

    pub fn take(&mut self, group: ParamGroup) -> Option<ParamBuffer> {
        self.slot(group).take()
    }

    fn slot(&mut self, group: ParamGroup) -> &mut Option<ParamBuffer> {
        match group {
            ParamGroup::Position => &mut self.positions,
            ParamGroup::FeaturesDc => &mut self.features_dc,
            ParamGroup::FeaturesRest => &mut self.features_rest,
            ParamGroup::Opacity => &mut self.opacities,
            ParamGroup::Scaling => &mut self.scalings,
            ParamGroup::Rotation => &mut self.rotations,
        }
    }

    /// Reindexes through a cardinality change. Synthetic rows are untouched.
    pub fn remap(&self, mapping: &RowMapping) -> crate::Result<Self> {
        let mut out = Self {
            touched: mapping.apply_vec(&self.touched, false)?,
            ..Self::default()
        };
        for group in ParamGroup::ALL {
            if let Some(buffer) = self.group(group) {
                out.set(group, Some(mapping.apply(buffer)?));
            }
        }
        Ok(out)
    }
}
