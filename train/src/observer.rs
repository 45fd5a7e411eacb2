//! Training telemetry.
//!
//! The trainer reports what happens as [`TrainingEvent`]s. Sinks implement
//! [`TrainingObserver`]; [`LogObserver`] writes to the log and
//! [`JsonlObserver`] appends one JSON object per event to a file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::densify::DensifyReport;
use crate::Result;

pub const PERCENTILES: [usize; 11] = [0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 95];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrainingEvent {
    Iteration {
        iteration: usize,
        loss: f32,
        ema_loss: f32,
        l1: f32,
        num_points: usize,
        elapsed_ms: f64,
    },
    Evaluation {
        iteration: usize,
        split: String,
        l1: f32,
        psnr: f32,
    },
    /// Opacity histogram (10 bins over `[0, 1]`) and size of the model.
    Histogram {
        iteration: usize,
        opacity: Vec<usize>,
        num_points: usize,
    },
    /// Percentile summaries at [`PERCENTILES`]. Radii series only cover
    /// primitives visible in the current frame.
    Percentiles {
        iteration: usize,
        scale_max: Vec<f32>,
        scale_min: Vec<f32>,
        scale_median: Vec<f32>,
        scale_mean: Vec<f32>,
        scale_max_div_min: Vec<f32>,
        /// Every component of the log-scale gradient.
        scaling_grad: Vec<f32>,
        opacity: Vec<f32>,
        max_radii: Vec<f32>,
        min_radii: Vec<f32>,
        radii: Vec<f32>,
        radii_min: Vec<f32>,
        average_grad: Vec<f32>,
        last_densify: Option<DensifyReport>,
    },
    Densified(DensifyReport),
    OpacityReset {
        iteration: usize,
    },
    Saved {
        iteration: usize,
        path: PathBuf,
    },
    Checkpointed {
        iteration: usize,
        path: PathBuf,
    },
}

pub trait TrainingObserver: Send {
    fn notify(&mut self, event: &TrainingEvent) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Logs evaluations and persistence at info level, everything else at debug.
#[derive(Debug, Clone, Default)]
pub struct LogObserver {
    /// Log a progress line every this many iterations; 0 disables it.
    pub progress_interval: usize,
}

impl LogObserver {
    pub fn new(progress_interval: usize) -> Self {
        Self { progress_interval }
    }
}

impl TrainingObserver for LogObserver {
    fn notify(&mut self, event: &TrainingEvent) -> Result<()> {
        match event {
            TrainingEvent::Iteration {
                iteration,
                ema_loss,
                num_points,
                ..
            } => {
                if self.progress_interval > 0 && iteration % self.progress_interval == 0 {
                    tracing::info!(
                        "[ITER {}] loss {:.7}, {} points",
                        iteration,
                        ema_loss,
                        num_points
                    );
                }
            }
            TrainingEvent::Evaluation {
                iteration,
                split,
                l1,
                psnr,
            } => tracing::info!("[ITER {}] Evaluating {}: L1 {} PSNR {}", iteration, split, l1, psnr),
            TrainingEvent::Saved { iteration, path } => {
                tracing::info!("[ITER {}] Saving Gaussians to {}", iteration, path.display())
            }
            TrainingEvent::Checkpointed { iteration, path } => {
                tracing::info!("[ITER {}] Saving checkpoint to {}", iteration, path.display())
            }
            other => tracing::debug!("{:?}", other),
        }
        Ok(())
    }
}

/// Appends events to `<dir>/metrics.jsonl`.
pub struct JsonlObserver {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlObserver {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("metrics.jsonl");
        let file = File::options().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrainingObserver for JsonlObserver {
    fn notify(&mut self, event: &TrainingEvent) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Fans every event out to all registered sinks. Sink errors never reach
/// the trainer.
#[derive(Default)]
pub struct Observers {
    sinks: Vec<Box<dyn TrainingObserver>>,
}

impl Observers {
    pub fn push(&mut self, sink: Box<dyn TrainingObserver>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Delivers `event` to every sink. A failing sink is logged and skipped.
    pub fn notify(&mut self, event: &TrainingEvent) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.notify(event) {
                tracing::warn!("training observer failed: {}", e);
            }
        }
    }

    pub fn flush(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                tracing::warn!("training observer flush failed: {}", e);
            }
        }
    }
}

/// Percentiles of `values`, one per entry of [`PERCENTILES`], read at sorted
/// index `min(n * p / 100, n - 1)`. Non-finite values are ignored.
pub fn percentiles(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return vec![0.0; PERCENTILES.len()];
    }
    let mut sorted: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return vec![0.0; PERCENTILES.len()];
    }
    sorted.sort_by(f32::total_cmp);
    let n = sorted.len();
    PERCENTILES
        .iter()
        .map(|&p| sorted[(n * p / 100).min(n - 1)])
        .collect()
}

/// Counts of `values` in `bins` equal-width bins over `[0, 1]`.
pub fn histogram(values: &[f32], bins: usize) -> Vec<usize> {
    let mut counts = vec![0; bins];
    if bins == 0 {
        return counts;
    }
    for &v in values {
        let bin = ((v.clamp(0.0, 1.0) * bins as f32) as usize).min(bins - 1);
        counts[bin] += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_of_ramp() {
        let values: Vec<f32> = (0..=100).map(|v| v as f32).collect();
        let p = percentiles(&values);
        assert_eq!(p[0], 0.0);
        assert_eq!(p[5], 50.0);
        assert_eq!(p[10], 95.0);
        assert_eq!(percentiles(&[]), vec![0.0; 11]);
    }

    #[test]
    fn test_percentiles_round_index_down() {
        let p = percentiles(&[30.0, 10.0, 20.0]);
        // 70% of 3 rows lands on index 2, 60% on index 1
        assert_eq!(p[6], 20.0);
        assert_eq!(p[7], 30.0);
        assert_eq!(p[10], 30.0);
        assert_eq!(percentiles(&[5.0, f32::NAN]), vec![5.0; 11]);
    }

    #[test]
    fn test_histogram_clamps() {
        assert_eq!(histogram(&[0.0, 0.05, 0.5, 1.0, 2.0], 10), vec![2, 0, 0, 0, 0, 1, 0, 0, 0, 2]);
    }

    struct Failing;

    impl TrainingObserver for Failing {
        fn notify(&mut self, _event: &TrainingEvent) -> Result<()> {
            Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn flush(&mut self) -> Result<()> {
            Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
    }

    struct Counting(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    impl TrainingObserver for Counting {
        fn notify(&mut self, _event: &TrainingEvent) -> Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_failing_sink_does_not_starve_others() {
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut observers = Observers::default();
        observers.push(Box::new(Failing));
        observers.push(Box::new(Counting(count.clone())));

        let event = TrainingEvent::OpacityReset { iteration: 3000 };
        observers.notify(&event);
        observers.notify(&event);
        observers.flush();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = TrainingEvent::Evaluation {
            iteration: 7000,
            split: "test".into(),
            l1: 0.05,
            psnr: 25.0,
        };
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.starts_with("{\"event\":\"evaluation\""));
    }
}
