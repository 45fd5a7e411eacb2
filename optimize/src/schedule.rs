use serde::{Deserialize, Serialize};

/// Log-linear decay from `lr_init` to `lr_final` over `max_steps`, with an
/// optional sine warm-up that starts at `lr_init * delay_mult`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExponentialLr {
    pub lr_init: f32,
    pub lr_final: f32,
    pub delay_steps: usize,
    pub delay_mult: f32,
    pub max_steps: usize,
}

impl ExponentialLr {
    pub fn new(lr_init: f32, lr_final: f32, max_steps: usize) -> Self {
        Self {
            lr_init,
            lr_final,
            delay_steps: 0,
            delay_mult: 1.0,
            max_steps,
        }
    }

    pub fn with_delay(mut self, delay_steps: usize, delay_mult: f32) -> Self {
        self.delay_steps = delay_steps;
        self.delay_mult = delay_mult;
        self
    }

    pub fn at(&self, step: i64) -> f32 {
        if step < 0 || (self.lr_init == 0.0 && self.lr_final == 0.0) {
            return 0.0;
        }
        let step = step as f64;
        let delay_rate = if self.delay_steps > 0 {
            let p = (step / self.delay_steps as f64).clamp(0.0, 1.0);
            let mult = self.delay_mult as f64;
            mult + (1.0 - mult) * (0.5 * std::f64::consts::PI * p).sin()
        } else {
            1.0
        };
        let t = if self.max_steps > 0 {
            (step / self.max_steps as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let init = self.lr_init as f64;
        let fin = self.lr_final as f64;
        let log_lerp = if t <= 0.0 {
            init
        } else if t >= 1.0 {
            fin
        } else if init > 0.0 && fin > 0.0 {
            init * (fin / init).powf(t)
        } else {
            // a zero endpoint pulls every interior step to zero
            0.0
        };
        (delay_rate * log_lerp) as f32
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LrSchedule {
    Constant(f32),
    Exponential(ExponentialLr),
}

impl LrSchedule {
    pub fn at(&self, iteration: usize) -> f32 {
        match self {
            LrSchedule::Constant(lr) => *lr,
            LrSchedule::Exponential(exp) => exp.at(iteration as i64),
        }
    }

    pub fn initial(&self) -> f32 {
        match self {
            LrSchedule::Constant(lr) => *lr,
            LrSchedule::Exponential(exp) => exp.lr_init,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_endpoints() {
        let s = ExponentialLr::new(1.6e-4, 1.6e-6, 30_000);
        assert!((s.at(0) - 1.6e-4).abs() < 1e-9);
        assert!((s.at(30_000) - 1.6e-6).abs() < 1e-10);
        assert!((s.at(60_000) - 1.6e-6).abs() < 1e-10);
        // geometric midpoint
        assert!((s.at(15_000) - 1.6e-5).abs() < 1e-8);
    }

    #[test]
    fn test_exponential_degenerate_cases() {
        assert_eq!(ExponentialLr::new(0.0, 0.0, 10).at(3), 0.0);
        assert_eq!(ExponentialLr::new(1.0, 0.1, 10).at(-1), 0.0);
    }

    #[test]
    fn test_zero_endpoint_never_yields_nan() {
        let to_zero = LrSchedule::Exponential(ExponentialLr::new(1e-3, 0.0, 100));
        assert!((to_zero.at(0) - 1e-3).abs() < 1e-9);
        assert_eq!(to_zero.at(50), 0.0);
        assert_eq!(to_zero.at(100), 0.0);

        let from_zero = ExponentialLr::new(0.0, 1e-3, 100);
        assert_eq!(from_zero.at(0), 0.0);
        assert_eq!(from_zero.at(50), 0.0);
        assert!((from_zero.at(100) - 1e-3).abs() < 1e-9);
        assert!((0..=100).all(|s| from_zero.at(s).is_finite() && to_zero.at(s as usize).is_finite()));
    }

    #[test]
    fn test_delay_warmup_starts_low() {
        let s = ExponentialLr::new(1.0, 1.0, 100).with_delay(10, 0.01);
        assert!((s.at(0) - 0.01).abs() < 1e-6);
        assert!((s.at(10) - 1.0).abs() < 1e-6);
    }
}
