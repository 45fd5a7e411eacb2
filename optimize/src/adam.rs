use gs_core::{Error, ParamBuffer, ParamGradients, ParamGroup, PrimitiveSet, Result, RowMapping};
use serde::{Deserialize, Serialize};

use crate::schedule::LrSchedule;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-15,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub group: ParamGroup,
    pub lr: f32,
    pub schedule: LrSchedule,
    pub step: u64,
    pub exp_avg: ParamBuffer,
    pub exp_avg_sq: ParamBuffer,
}

impl GroupState {
    fn rows(&self) -> usize {
        self.exp_avg.rows()
    }
}

/// Adam over the parameter groups of a [`PrimitiveSet`].
///
/// Moment buffers are indexed in lockstep with primitive rows and follow
/// every cardinality change through [`Adam::resize_for`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub config: AdamConfig,
    groups: Vec<GroupState>,
}

impl Adam {
    pub fn new(
        primitives: &PrimitiveSet,
        schedules: Vec<(ParamGroup, LrSchedule)>,
        config: AdamConfig,
    ) -> Self {
        let n = primitives.len();
        let groups = schedules
            .into_iter()
            .map(|(group, schedule)| {
                let width = primitives.group(group).width();
                GroupState {
                    group,
                    lr: schedule.initial(),
                    schedule,
                    step: 0,
                    exp_avg: ParamBuffer::zeros(n, width),
                    exp_avg_sq: ParamBuffer::zeros(n, width),
                }
            })
            .collect();
        Self { config, groups }
    }

    pub fn groups(&self) -> &[GroupState] {
        &self.groups
    }

    pub fn group(&self, group: ParamGroup) -> Option<&GroupState> {
        self.groups.iter().find(|g| g.group == group)
    }

    fn group_state_mut(&mut self, group: ParamGroup) -> Option<&mut GroupState> {
        self.groups.iter_mut().find(|g| g.group == group)
    }

    pub fn lr(&self, group: ParamGroup) -> Option<f32> {
        self.group(group).map(|g| g.lr)
    }

    pub fn set_lr(&mut self, group: ParamGroup, lr: f32) {
        if let Some(g) = self.group_state_mut(group) {
            g.lr = lr;
        }
    }

    /// Re-evaluates every group's schedule at `iteration`.
    pub fn update_learning_rate(&mut self, iteration: usize) {
        for g in &mut self.groups {
            g.lr = g.schedule.at(iteration);
        }
    }

    /// Row count of the moment buffers. All groups share it.
    pub fn rows(&self) -> usize {
        self.groups.first().map(GroupState::rows).unwrap_or(0)
    }

    pub fn check_rows(&self, expected: usize) -> Result<()> {
        for g in &self.groups {
            if g.rows() != expected {
                return Err(Error::InvariantViolation(format!(
                    "optimizer group {} tracks {} rows but the primitive set has {}",
                    g.group.name(),
                    g.rows(),
                    expected
                )));
            }
        }
        Ok(())
    }

    /// Applies one update to every group that has a gradient.
    ///
    /// Rows not marked `touched` keep both their parameters and moments.
    pub fn step(&mut self, primitives: &mut PrimitiveSet, grads: &ParamGradients) -> Result<()> {
        let n = primitives.len();
        self.check_rows(n)?;
        if grads.rows() != n {
            return Err(Error::InvariantViolation(format!(
                "gradients cover {} rows but the primitive set has {}",
                grads.rows(),
                n
            )));
        }

        let AdamConfig { beta1, beta2, eps } = self.config.clone();
        for state in &mut self.groups {
            let Some(grad) = grads.group(state.group) else {
                continue;
            };
            let param = primitives.group_mut(state.group);
            if grad.width() != param.width() || grad.rows() != n {
                return Err(Error::DimensionMismatch(format!(
                    "gradient for {} is {}x{}, parameter is {}x{}",
                    state.group.name(),
                    grad.rows(),
                    grad.width(),
                    param.rows(),
                    param.width()
                )));
            }

            state.step += 1;
            let bias1 = 1.0 - beta1.powi(state.step as i32);
            let bias2_sqrt = (1.0 - beta2.powi(state.step as i32)).sqrt();
            let step_size = state.lr / bias1;

            for row in 0..n {
                if !grads.touched[row] {
                    continue;
                }
                let g = grad.row(row);
                let m = state.exp_avg.row_mut(row);
                for (m, &g) in m.iter_mut().zip(g) {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                }
                let v = state.exp_avg_sq.row_mut(row);
                for (v, &g) in v.iter_mut().zip(g) {
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                }
                let m = state.exp_avg.row(row);
                let v = state.exp_avg_sq.row(row);
                for ((p, &m), &v) in param.row_mut(row).iter_mut().zip(m).zip(v) {
                    *p -= step_size * m / (v.sqrt() / bias2_sqrt + eps);
                }
            }
        }
        Ok(())
    }

    /// Follows a primitive cardinality change: surviving rows keep their
    /// moments, synthetic rows start at zero, removed rows are dropped.
    pub fn resize_for(&mut self, mapping: &RowMapping) -> Result<()> {
        for g in &mut self.groups {
            let exp_avg = mapping.apply(&g.exp_avg)?;
            let exp_avg_sq = mapping.apply(&g.exp_avg_sq)?;
            g.exp_avg = exp_avg;
            g.exp_avg_sq = exp_avg_sq;
        }
        tracing::debug!(
            "optimizer resized {} -> {} rows",
            mapping.old_len(),
            mapping.new_len()
        );
        Ok(())
    }

    /// Zeroes both moments of one group, used when its parameter is replaced wholesale.
    pub fn reset_group(&mut self, group: ParamGroup) {
        if let Some(g) = self.group_state_mut(group) {
            g.exp_avg.fill(0.0);
            g.exp_avg_sq.fill(0.0);
        }
    }
}
