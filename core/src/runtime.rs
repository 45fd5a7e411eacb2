//! Process-wide rayon pool shared by the rasterizer and the losses.

use rayon::ThreadPoolBuilder;
use std::env;
use std::sync::OnceLock;

const THREADS_ENV: &str = "RUSTGS_CPU_THREADS";

static THREAD_POOL_INIT: OnceLock<Result<usize, String>> = OnceLock::new();

/// Builds the global rayon pool once and returns the resulting worker count.
///
/// The count comes from `num_threads`, then `RUSTGS_CPU_THREADS`, then the
/// rayon default. Later calls return the outcome of the first one.
pub fn init_global_thread_pool(num_threads: Option<usize>) -> Result<usize, String> {
    THREAD_POOL_INIT
        .get_or_init(|| {
            let requested = match num_threads {
                Some(0) => return Err("thread count must be >= 1".to_string()),
                Some(n) => Some(n),
                None => threads_from_env()?,
            };

            let mut builder = ThreadPoolBuilder::new();
            if let Some(n) = requested {
                builder = builder.num_threads(n);
            }
            builder.build_global().map_err(|e| e.to_string())?;

            let threads = rayon::current_num_threads();
            tracing::debug!("rayon pool ready with {} threads", threads);
            Ok(threads)
        })
        .clone()
}

pub fn current_cpu_threads() -> usize {
    rayon::current_num_threads()
}

fn threads_from_env() -> Result<Option<usize>, String> {
    match env::var(THREADS_ENV) {
        Ok(raw) => parse_thread_count(&raw).map(Some),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(format!("failed to read {THREADS_ENV}: {e}")),
    }
}

fn parse_thread_count(raw: &str) -> Result<usize, String> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(format!("{THREADS_ENV} must be >= 1")),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("{THREADS_ENV} must be a positive integer, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_thread_count() {
        assert_eq!(parse_thread_count("4"), Ok(4));
        assert_eq!(parse_thread_count(" 2 "), Ok(2));
        assert!(parse_thread_count("0").is_err());
        assert!(parse_thread_count("many").is_err());
    }
}
