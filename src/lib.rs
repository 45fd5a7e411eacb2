pub use gs_core as core;
pub use gs_optimize as optimize;
pub use gs_rendering as rendering;
pub use gs_train as train;

/// Initialize the global Rayon thread pool used by rasterization and losses.
///
/// Call this once at startup before training. Repeated calls return the first
/// result. Returns the number of worker threads.
///
/// Priority order:
/// 1. explicit `num_threads`
/// 2. `RUSTGS_CPU_THREADS` env var
/// 3. Rayon default
pub fn init_thread_pool(num_threads: Option<usize>) -> Result<usize, String> {
    gs_core::init_global_thread_pool(num_threads)
}
