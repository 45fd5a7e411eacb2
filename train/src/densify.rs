//! Adaptive density control.
//!
//! Between passes the controller folds every render's screen statistics into
//! the primitive table. Every `densification_interval` iterations it clones
//! small high-gradient primitives, splits large ones and prunes transparent or
//! oversized ones, then resets the statistics. Opacities are periodically
//! forced down so that primitives have to earn their opacity back.

use gs_core::{Error as CoreError, Primitive, PrimitiveSet, StatField};
use gs_rendering::RenderOutput;
use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::config::OptimizationConfig;
use crate::model::GaussianModel;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensifyConfig {
    pub densify_from_iter: usize,
    pub densify_until_iter: usize,
    pub densification_interval: usize,
    pub opacity_reset_interval: usize,
    pub densify_grad_threshold: f32,
    pub percent_dense: f32,
    pub min_opacity: f32,
    pub max_screen_size: f32,
    pub opacity_reset_value: f32,
    pub split_count: usize,
    pub white_background: bool,
}

impl Default for DensifyConfig {
    fn default() -> Self {
        Self::from_optimization(&OptimizationConfig::default(), false)
    }
}

impl DensifyConfig {
    pub fn from_optimization(opt: &OptimizationConfig, white_background: bool) -> Self {
        Self {
            densify_from_iter: opt.densify_from_iter,
            densify_until_iter: opt.densify_until_iter,
            densification_interval: opt.densification_interval,
            opacity_reset_interval: opt.opacity_reset_interval,
            densify_grad_threshold: opt.densify_grad_threshold,
            percent_dense: opt.percent_dense,
            min_opacity: opt.min_opacity,
            max_screen_size: opt.max_screen_size,
            opacity_reset_value: 0.01,
            split_count: 2,
            white_background,
        }
    }

    /// Children of a split shrink by this factor.
    pub fn split_scale_divisor(&self) -> f32 {
        0.8 * self.split_count as f32
    }
}

/// Rows chosen for densification, as indices into the set before the pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub clone: Vec<usize>,
    pub split: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DensifyReport {
    pub iteration: usize,
    pub before: usize,
    pub cloned: usize,
    /// Split parents. Each was replaced by `split_count` children.
    pub split: usize,
    pub pruned: usize,
    pub after: usize,
}

/// What the controller did during one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DensityStep {
    pub report: Option<DensifyReport>,
    pub opacity_reset: bool,
}

pub struct DensityController {
    pub config: DensifyConfig,
    extent: f32,
    rng: StdRng,
    last_report: Option<DensifyReport>,
}

impl DensityController {
    pub fn new(config: DensifyConfig, extent: f32, seed: u64) -> Self {
        Self {
            config,
            extent,
            rng: StdRng::seed_from_u64(seed),
            last_report: None,
        }
    }

    pub fn extent(&self) -> f32 {
        self.extent
    }

    pub fn last_report(&self) -> Option<&DensifyReport> {
        self.last_report.as_ref()
    }

    pub fn is_active(&self, iteration: usize) -> bool {
        iteration < self.config.densify_until_iter
    }

    pub fn should_densify(&self, iteration: usize) -> bool {
        self.is_active(iteration)
            && iteration > self.config.densify_from_iter
            && iteration % self.config.densification_interval == 0
    }

    pub fn should_reset_opacity(&self, iteration: usize) -> bool {
        self.is_active(iteration)
            && (iteration % self.config.opacity_reset_interval == 0
                || (self.config.white_background && iteration == self.config.densify_from_iter))
    }

    /// Screen-size pruning only starts after the first opacity reset.
    pub fn size_threshold(&self, iteration: usize) -> Option<f32> {
        (iteration > self.config.opacity_reset_interval).then_some(self.config.max_screen_size)
    }

    /// Folds one render's radii and screen-space gradients into the statistics.
    pub fn record(
        &self,
        primitives: &mut PrimitiveSet,
        render: &RenderOutput,
        screen_grads: &[Vector2<f32>],
    ) -> Result<()> {
        let n = primitives.len();
        if render.visibility.len() != n
            || render.radii.len() != n
            || render.radii_min.len() != n
            || screen_grads.len() != n
        {
            return Err(CoreError::InvariantViolation(format!(
                "render statistics cover {} rows, primitive set has {}",
                render.visibility.len(),
                n
            ))
            .into());
        }

        let stats = &mut primitives.stats;
        for i in 0..n {
            if !render.visibility[i] {
                continue;
            }
            stats.max_radii[i] = stats.max_radii[i].max(render.radii[i]);
            let r_min = render.radii_min[i];
            stats.min_radii[i] = if stats.min_radii[i] == 0.0 {
                r_min
            } else {
                stats.min_radii[i].min(r_min)
            };
            stats.grad_accum[i] += screen_grads[i].norm();
            stats.grad_count[i] += 1.0;
        }
        Ok(())
    }

    /// Splits the gradient-qualifying rows into clone and split sets by world size.
    pub fn select(&self, primitives: &PrimitiveSet) -> Selection {
        let size_limit = self.config.percent_dense * self.extent;
        let mut selection = Selection::default();
        for (i, grad) in primitives.average_grads().into_iter().enumerate() {
            if grad < self.config.densify_grad_threshold {
                continue;
            }
            if primitives.max_scale(i) <= size_limit {
                selection.clone.push(i);
            } else {
                selection.split.push(i);
            }
        }
        selection
    }

    fn split_children(&mut self, parent: &Primitive) -> Vec<Primitive> {
        let scale = parent.scale();
        let rotation = parent.rotation_matrix();
        let log_scale = (scale / self.config.split_scale_divisor()).map(f32::ln);
        (0..self.config.split_count)
            .map(|_| {
                let n: Vector3<f32> = Vector3::new(
                    StandardNormal.sample(&mut self.rng),
                    StandardNormal.sample(&mut self.rng),
                    StandardNormal.sample(&mut self.rng),
                );
                Primitive {
                    position: rotation * scale.component_mul(&n) + parent.position,
                    log_scale,
                    ..parent.clone()
                }
            })
            .collect()
    }

    /// Clones, splits and prunes in one pass, then resets the statistics.
    ///
    /// Additions come first; pruning is evaluated on the grown set, with split
    /// parents removed alongside.
    pub fn densify_and_prune(&mut self, model: &mut GaussianModel, iteration: usize) -> Result<DensifyReport> {
        let before = model.len();
        let selection = self.select(&model.primitives);
        let size_threshold = self.size_threshold(iteration);
        let min_opacity = self.config.min_opacity;
        let big_world = 0.1 * self.extent;
        let mut pruned = 0;

        let mut split_parent = vec![false; before];
        for &i in &selection.split {
            split_parent[i] = true;
        }

        model.change_cardinality(|set| {
            let cloned = set.append_from(&selection.clone, |p| vec![p.clone()]);
            let children = set.append_from(&selection.split, |p| self.split_children(p));

            let remove: Vec<bool> = (0..set.len())
                .map(|i| {
                    if i < before && split_parent[i] {
                        return false;
                    }
                    let low_opacity = set.opacity(i) < min_opacity;
                    let oversized = size_threshold.map_or(false, |limit| {
                        set.stats.max_radii[i] > limit || set.max_scale(i) > big_world
                    });
                    low_opacity || oversized
                })
                .collect();
            pruned = remove.iter().filter(|&&r| r).count();

            let shrink = set.remove_where(|i| remove[i] || (i < before && split_parent[i]))?;
            set.reset_stat(StatField::All);
            Ok(cloned.then(&children)?.then(&shrink)?)
        })?;

        let report = DensifyReport {
            iteration,
            before,
            cloned: selection.clone.len(),
            split: selection.split.len(),
            pruned,
            after: model.len(),
        };
        tracing::debug!(
            "densify @{}: {} -> {} (cloned {}, split {}, pruned {})",
            iteration,
            report.before,
            report.after,
            report.cloned,
            report.split,
            report.pruned
        );
        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// Per-iteration density control: record statistics, then densify and
    /// reset opacity when due. Does nothing once densification has ended.
    pub fn step(
        &mut self,
        model: &mut GaussianModel,
        iteration: usize,
        render: &RenderOutput,
        screen_grads: &[Vector2<f32>],
    ) -> Result<DensityStep> {
        if !self.is_active(iteration) {
            return Ok(DensityStep::default());
        }
        self.record(&mut model.primitives, render, screen_grads)?;

        let report = if self.should_densify(iteration) {
            Some(self.densify_and_prune(model, iteration)?)
        } else {
            None
        };

        let opacity_reset = self.should_reset_opacity(iteration);
        if opacity_reset {
            model.reset_opacity(self.config.opacity_reset_value);
            tracing::debug!(
                "opacity reset @{} to {}",
                iteration,
                self.config.opacity_reset_value
            );
        }
        Ok(DensityStep {
            report,
            opacity_reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gs_core::Image;
    use nalgebra::Vector4;

    fn set_with_scales(scales: &[f32]) -> PrimitiveSet {
        let mut set = PrimitiveSet::new(0);
        for (i, &s) in scales.iter().enumerate() {
            set.push(Primitive {
                position: Vector3::new(i as f32, 0.0, 0.0),
                features_dc: Vector3::zeros(),
                features_rest: vec![],
                opacity_logit: 1.0,
                log_scale: Vector3::repeat(s.ln()),
                rotation: Vector4::new(1.0, 0.0, 0.0, 0.0),
            });
        }
        set
    }

    fn render(n: usize, visible: &[usize], radius: f32) -> RenderOutput {
        let mut out = RenderOutput {
            image: Image::new(1, 1, 3),
            visibility: vec![false; n],
            radii: vec![0.0; n],
            radii_min: vec![0.0; n],
        };
        for &i in visible {
            out.visibility[i] = true;
            out.radii[i] = radius;
            out.radii_min[i] = radius / 2.0;
        }
        out
    }

    #[test]
    fn test_record_tracks_min_and_max_radii() {
        let controller = DensityController::new(DensifyConfig::default(), 1.0, 0);
        let mut set = set_with_scales(&[0.01, 0.01]);
        let grads = vec![Vector2::new(3.0, 4.0); 2];

        controller.record(&mut set, &render(2, &[0], 6.0), &grads).unwrap();
        controller.record(&mut set, &render(2, &[0], 10.0), &grads).unwrap();

        assert_eq!(set.stats.max_radii, vec![10.0, 0.0]);
        assert_eq!(set.stats.min_radii, vec![3.0, 0.0]);
        assert_eq!(set.stats.grad_accum, vec![10.0, 0.0]);
        assert_eq!(set.stats.grad_count, vec![2.0, 0.0]);
        assert!(controller.record(&mut set, &render(3, &[], 1.0), &grads).is_err());
    }

    #[test]
    fn test_schedule_predicates() {
        let mut config = DensifyConfig::default();
        let controller = DensityController::new(config.clone(), 1.0, 0);
        assert!(!controller.should_densify(500));
        assert!(controller.should_densify(600));
        assert!(!controller.should_densify(15_000));
        assert!(controller.should_reset_opacity(3000));
        assert!(!controller.should_reset_opacity(500));
        assert_eq!(controller.size_threshold(3000), None);
        assert_eq!(controller.size_threshold(3100), Some(20.0));

        config.white_background = true;
        let white = DensityController::new(config, 1.0, 0);
        assert!(white.should_reset_opacity(500));
    }

    #[test]
    fn test_split_children_shrink_and_stay_near_parent() {
        let mut controller = DensityController::new(DensifyConfig::default(), 1.0, 42);
        let set = set_with_scales(&[0.5]);
        let parent = set.primitive(0);
        let children = controller.split_children(&parent);
        assert_eq!(children.len(), 2);
        for child in &children {
            assert!((child.scale().x - 0.5 / 1.6).abs() < 1e-5);
            assert_eq!(child.opacity_logit, parent.opacity_logit);
            assert!((child.position - parent.position).norm() < 0.5 * 6.0);
        }
        assert_ne!(children[0].position, children[1].position);
    }
}
