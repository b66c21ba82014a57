use std::env;
use std::sync::OnceLock;

/// A wrapper around the Rayon thread pool used by native kernels.
pub struct ThreadPool {
    /// The wrapped pool, or None if construction failed, in which case work
    /// runs on the calling thread.
    pool: Option<rayon::ThreadPool>,
}

impl ThreadPool {
    /// Run a function in the thread pool.
    ///
    /// This corresponds to [`rayon::ThreadPool::install`].
    pub fn run<R: Send, Op: FnOnce() -> R + Send>(&self, op: Op) -> R {
        if let Some(pool) = self.pool.as_ref() {
            pool.install(op)
        } else {
            op()
        }
    }

    /// Create a thread pool with a given number of threads.
    pub fn with_num_threads(num_threads: usize) -> ThreadPool {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("sten-{}", index))
            .build();

        ThreadPool { pool: pool.ok() }
    }

    /// Return the number of threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.pool
            .as_ref()
            .map(|pool| pool.current_num_threads())
            .unwrap_or(1)
    }
}

/// Parse a `STEN_NUM_THREADS` value, clamping it to the logical core count.
fn parse_thread_count(value: &str, default: usize) -> usize {
    match value.trim().parse::<usize>() {
        Ok(n_threads) => n_threads.clamp(1, num_cpus::get().max(1)),
        Err(_) => default,
    }
}

/// Return the [Rayon][rayon] thread pool which native kernels run in.
///
/// The pool size defaults to the number of physical cores. It can be
/// overridden by setting `STEN_NUM_THREADS` to a number between 1 and the
/// logical core count.
///
/// [rayon]: https://github.com/rayon-rs/rayon
pub fn thread_pool() -> &'static ThreadPool {
    static THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();
    THREAD_POOL.get_or_init(|| {
        let physical_cpus = num_cpus::get_physical().max(1);
        let num_threads = match env::var_os("STEN_NUM_THREADS") {
            Some(threads_var) => parse_thread_count(&threads_var.to_string_lossy(), physical_cpus),
            None => physical_cpus,
        };
        ThreadPool::with_num_threads(num_threads)
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_thread_count, thread_pool, ThreadPool};

    #[test]
    fn test_parse_thread_count() {
        assert_eq!(parse_thread_count("1", 4), 1);
        assert_eq!(parse_thread_count("0", 4), 1);
        assert_eq!(parse_thread_count("lots", 4), 4);
        assert!(parse_thread_count("100000", 4) <= num_cpus::get());
    }

    #[test]
    fn test_thread_pool_run() {
        let pool = ThreadPool::with_num_threads(2);
        assert_eq!(pool.num_threads(), 2);
        assert_eq!(pool.run(|| 1 + 2), 3);
        assert!(thread_pool().num_threads() >= 1);
    }
}
