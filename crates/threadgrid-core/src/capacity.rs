//! Capacity estimation — how many threads the pool may ever hold.
//!
//! With `max_threads = "auto"` the cap is derived once at startup:
//!
//! ```text
//! max_threads = total_system_memory / per_thread_memory_budget
//! ```
//!
//! If either input is unknown, or the budget is non-positive (the
//! runtime's "unlimited"), the cap falls back to `2 × min_threads`.
//! The result is never below `min_threads`.

use tracing::{debug, warn};

use crate::config::MaxThreads;

/// Compute the effective maximum thread count.
pub fn compute_max_threads(
    min_threads: usize,
    max_threads: MaxThreads,
    per_thread_budget: Option<i64>,
    total_memory: Option<u64>,
) -> usize {
    let computed = match max_threads {
        MaxThreads::Fixed(n) => n,
        MaxThreads::Auto => match (per_thread_budget, total_memory) {
            (Some(budget), Some(total)) if budget > 0 && total > 0 => {
                let n = (total / budget as u64) as usize;
                debug!(
                    per_thread_budget_mb = budget / 1024 / 1024,
                    max_threads = n,
                    "automatic thread limit"
                );
                n
            }
            _ => {
                let n = min_threads * 2;
                debug!(max_threads = n, "automatic thread limit (default)");
                n
            }
        },
    };

    if computed < min_threads {
        warn!(
            max_threads = computed,
            min_threads, "max_threads is below min_threads, raising it to min_threads"
        );
        return min_threads;
    }
    computed
}

/// Total physical memory in bytes, if the platform reports it.
#[cfg(unix)]
pub fn total_system_memory() -> Option<u64> {
    // SAFETY: sysconf has no preconditions and only reads system values.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    (pages as u64).checked_mul(page_size as u64)
}

#[cfg(not(unix))]
pub fn total_system_memory() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: i64 = 1024 * 1024;

    #[test]
    fn fixed_max_is_used_as_is() {
        assert_eq!(compute_max_threads(2, MaxThreads::Fixed(5), None, None), 5);
    }

    #[test]
    fn fixed_max_below_min_is_clamped() {
        assert_eq!(compute_max_threads(4, MaxThreads::Fixed(2), None, None), 4);
    }

    #[test]
    fn auto_divides_memory_by_budget() {
        // 8 GiB / 128 MiB = 64
        assert_eq!(
            compute_max_threads(2, MaxThreads::Auto, Some(128 * MIB), Some(8 * GIB)),
            64
        );
    }

    #[test]
    fn auto_floors_the_division() {
        // 1000 MiB / 300 MiB = 3.33 → 3
        let total = 1000 * MIB as u64;
        assert_eq!(
            compute_max_threads(1, MaxThreads::Auto, Some(300 * MIB), Some(total)),
            3
        );
    }

    #[test]
    fn auto_falls_back_without_budget() {
        assert_eq!(compute_max_threads(3, MaxThreads::Auto, None, Some(8 * GIB)), 6);
        assert_eq!(compute_max_threads(3, MaxThreads::Auto, Some(-1), Some(8 * GIB)), 6);
        assert_eq!(compute_max_threads(3, MaxThreads::Auto, Some(0), Some(8 * GIB)), 6);
    }

    #[test]
    fn auto_falls_back_without_system_memory() {
        assert_eq!(compute_max_threads(3, MaxThreads::Auto, Some(128 * MIB), None), 6);
        assert_eq!(compute_max_threads(3, MaxThreads::Auto, Some(128 * MIB), Some(0)), 6);
    }

    #[test]
    fn auto_result_is_clamped_to_min() {
        // 1 GiB / 512 MiB = 2 < min of 8
        assert_eq!(
            compute_max_threads(8, MaxThreads::Auto, Some(512 * MIB), Some(GIB)),
            8
        );
    }

    #[cfg(unix)]
    #[test]
    fn system_memory_is_reported_on_unix() {
        let total = total_system_memory().unwrap();
        assert!(total > 0);
    }
}
