use anyhow::{Context, Result};
use rayon::ThreadPoolBuilder;

/// Runs `f` inside a dedicated rayon pool when a core count is given,
/// otherwise on the global pool.
pub fn run_in_pool<T, F>(cores: Option<usize>, context: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    if let Some(cores) = cores {
        let pool = ThreadPoolBuilder::new()
            .num_threads(cores)
            .build()
            .context(context)?;
        Ok(pool.install(f))
    } else {
        Ok(f())
    }
}

pub fn resolve_threads(cores: Option<usize>, groups: usize) -> Option<usize> {
    if let Some(cores) = cores {
        let capped = cores.min(groups.max(1));
        if cores > capped {
            tracing::warn!(
                "Provided cores ({cores}) greater than number of groups ({groups}); using {capped}"
            );
        }
        Some(capped)
    } else {
        None
    }
}

pub fn collect_results<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(results.len());
    for res in results {
        out.push(res?);
    }
    Ok(out)
}
