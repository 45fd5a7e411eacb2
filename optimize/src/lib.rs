//! First-order optimization over a primitive table whose size changes during training.

pub mod adam;
pub mod schedule;

pub use adam::{Adam, AdamConfig, GroupState};
pub use schedule::{ExponentialLr, LrSchedule};
