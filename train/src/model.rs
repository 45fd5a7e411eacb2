//! The trainable model: primitives, optimizer state and staged gradients.
//!
//! All three hold one row per primitive. Every cardinality change goes through
//! [`GaussianModel::change_cardinality`] or [`GaussianModel::apply_mapping`],
//! which reindex them together under a single `&mut` borrow.

use gs_core::{
    Error as CoreError, ParamGradients, ParamGroup, PointCloud, PrimitiveSet, RowMapping,
};
use gs_optimize::{Adam, AdamConfig, ExponentialLr, LrSchedule};
use serde::{Deserialize, Serialize};

use crate::config::OptimizationConfig;
use crate::Result;

#[derive(Debug, Clone)]
pub struct GaussianModel {
    pub primitives: PrimitiveSet,
    pub optimizer: Adam,
    active_sh_degree: usize,
    spatial_lr_scale: f32,
    grads: Option<ParamGradients>,
}

/// Model state persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub active_sh_degree: usize,
    pub spatial_lr_scale: f32,
    pub primitives: PrimitiveSet,
}

/// Per-group learning-rate schedules. Positions decay exponentially and are
/// scaled by the scene extent; the higher SH bands learn 20x slower than DC.
pub fn param_schedules(opt: &OptimizationConfig, spatial_lr_scale: f32) -> Vec<(ParamGroup, LrSchedule)> {
    let position = ExponentialLr::new(
        opt.position_lr_init * spatial_lr_scale,
        opt.position_lr_final * spatial_lr_scale,
        opt.position_lr_max_steps,
    )
    .with_delay(0, opt.position_lr_delay_mult);

    vec![
        (ParamGroup::Position, LrSchedule::Exponential(position)),
        (ParamGroup::FeaturesDc, LrSchedule::Constant(opt.feature_lr)),
        (ParamGroup::FeaturesRest, LrSchedule::Constant(opt.feature_lr / 20.0)),
        (ParamGroup::Opacity, LrSchedule::Constant(opt.opacity_lr)),
        (ParamGroup::Scaling, LrSchedule::Constant(opt.scaling_lr)),
        (ParamGroup::Rotation, LrSchedule::Constant(opt.rotation_lr)),
    ]
}

impl GaussianModel {
    pub fn new(primitives: PrimitiveSet, opt: &OptimizationConfig, spatial_lr_scale: f32) -> Self {
        let optimizer = Adam::new(
            &primitives,
            param_schedules(opt, spatial_lr_scale),
            AdamConfig::default(),
        );
        Self {
            primitives,
            optimizer,
            active_sh_degree: 0,
            spatial_lr_scale,
            grads: None,
        }
    }

    pub fn from_point_cloud(
        cloud: &PointCloud,
        sh_degree: usize,
        opt: &OptimizationConfig,
        spatial_lr_scale: f32,
    ) -> Result<Self> {
        let primitives = PrimitiveSet::from_point_cloud(cloud, sh_degree)?;
        tracing::info!("Number of points at initialisation: {}", primitives.len());
        Ok(Self::new(primitives, opt, spatial_lr_scale))
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn active_sh_degree(&self) -> usize {
        self.active_sh_degree
    }

    pub fn max_sh_degree(&self) -> usize {
        self.primitives.max_sh_degree()
    }

    pub fn spatial_lr_scale(&self) -> f32 {
        self.spatial_lr_scale
    }

    /// Re-evaluates the schedules and returns the position learning rate.
    pub fn update_learning_rate(&mut self, iteration: usize) -> f32 {
        self.optimizer.update_learning_rate(iteration);
        self.optimizer.lr(ParamGroup::Position).unwrap_or(0.0)
    }

    /// Raises the active SH degree by one, saturating at the model maximum.
    pub fn oneup_sh_degree(&mut self) {
        if self.active_sh_degree < self.max_sh_degree() {
            self.active_sh_degree += 1;
            tracing::debug!("active SH degree raised to {}", self.active_sh_degree);
        }
    }

    pub fn stage_gradients(&mut self, grads: ParamGradients) -> Result<()> {
        if grads.rows() != self.len() {
            return Err(CoreError::InvariantViolation(format!(
                "staged gradients cover {} rows, model has {}",
                grads.rows(),
                self.len()
            ))
            .into());
        }
        self.grads = Some(grads);
        Ok(())
    }

    pub fn staged_gradients(&self) -> Option<&ParamGradients> {
        self.grads.as_ref()
    }

    pub fn zero_gradients(&mut self) {
        self.grads = None;
    }

    /// One optimizer step with the staged gradients. A no-op when nothing is staged.
    pub fn step(&mut self) -> Result<()> {
        if let Some(grads) = &self.grads {
            self.optimizer.step(&mut self.primitives, grads)?;
        }
        Ok(())
    }

    /// Runs a cardinality change on the primitives and carries the optimizer
    /// moments and staged gradients through the mapping it returns.
    pub fn change_cardinality<F>(&mut self, change: F) -> Result<RowMapping>
    where
        F: FnOnce(&mut PrimitiveSet) -> Result<RowMapping>,
    {
        let old_len = self.len();
        let mapping = change(&mut self.primitives)?;
        if mapping.old_len() != old_len || mapping.new_len() != self.len() {
            return Err(CoreError::InvariantViolation(format!(
                "mapping {} -> {} does not describe the change {} -> {}",
                mapping.old_len(),
                mapping.new_len(),
                old_len,
                self.len()
            ))
            .into());
        }
        self.follow_mapping(&mapping)?;
        Ok(mapping)
    }

    /// Reindexes primitives, optimizer moments and staged gradients through
    /// a mapping that only keeps or reorders rows.
    pub fn apply_mapping(&mut self, mapping: &RowMapping) -> Result<()> {
        if mapping.synthetic() > 0 {
            return Err(CoreError::InvalidInput(
                "mappings with synthetic rows must go through change_cardinality".into(),
            )
            .into());
        }
        self.primitives.apply_mapping(mapping)?;
        self.follow_mapping(mapping)
    }

    fn follow_mapping(&mut self, mapping: &RowMapping) -> Result<()> {
        self.optimizer.resize_for(mapping)?;
        if let Some(grads) = &self.grads {
            self.grads = Some(grads.remap(mapping)?);
        }
        self.check_lockstep()
    }

    pub fn check_lockstep(&self) -> Result<()> {
        let n = self.len();
        self.primitives.validate()?;
        self.optimizer.check_rows(n)?;
        if let Some(grads) = &self.grads {
            if grads.rows() != n {
                return Err(CoreError::InvariantViolation(format!(
                    "staged gradients cover {} rows, model has {}",
                    grads.rows(),
                    n
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Forces every opacity to `value`, zeroes the opacity moments and drops
    /// the staged opacity gradient.
    pub fn reset_opacity(&mut self, value: f32) {
        self.primitives.set_all_opacities(value);
        self.optimizer.reset_group(ParamGroup::Opacity);
        if let Some(grads) = &mut self.grads {
            grads.take(ParamGroup::Opacity);
        }
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            active_sh_degree: self.active_sh_degree,
            spatial_lr_scale: self.spatial_lr_scale,
            primitives: self.primitives.clone(),
        }
    }

    /// Rebuilds a model from a snapshot and the optimizer state saved with it.
    pub fn restore(snapshot: ModelSnapshot, optimizer: Adam) -> Result<Self> {
        let model = Self {
            primitives: snapshot.primitives,
            optimizer,
            active_sh_degree: snapshot.active_sh_degree,
            spatial_lr_scale: snapshot.spatial_lr_scale,
            grads: None,
        };
        model.check_lockstep()?;
        Ok(model)
    }
}
