//! Utility functions
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, a poisoned lock still hands out its data.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// transform bytes into a human readable format.
pub fn to_human_readable(n: u64) -> String {
    let mut n = n as f64;

    let units = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    let delimiter = 1000_f64;

    if n < delimiter {
        return format!("{} {}", n, "B");
    }

    let mut u: usize = 0;
    let r = 10_f64;

    while (n * r).round() / r >= delimiter && u < units.len() - 1 {
        n /= delimiter;
        u += 1;
    }

    format!("{:.2} {}", n, units[u])
}

/// Uploaded over downloaded, zero while nothing was downloaded.
pub fn ratio(uploaded: u64, downloaded: u64) -> f64 {
    if downloaded == 0 {
        return 0.0;
    }
    uploaded as f64 / downloaded as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn readable_size() {
        assert_eq!(to_human_readable(512), "512 B");

        let n = 483_740;
        assert_eq!(to_human_readable(n), "483.74 KB");

        let n = 28_780_000;
        assert_eq!(to_human_readable(n), "28.78 MB");

        let n = 1_950_000_000;
        assert_eq!(to_human_readable(n), "1.95 GB");
    }

    #[test]
    pub fn ratio_without_download() {
        assert_eq!(ratio(100, 0), 0.0);
        assert_eq!(ratio(100, 50), 2.0);
    }
}
