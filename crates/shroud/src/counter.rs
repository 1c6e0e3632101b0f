use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use tokio::time::Instant;

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

#[derive(Debug)]
struct Window {
    last_update: Instant,
    ema_download: f64,
    ema_upload: f64,
}

/// Transfer totals and smoothed rates, in bytes and bytes per second.
///
/// Each connection has one, and so does each torrent.
#[derive(Debug)]
pub struct Counter {
    total_downloaded: AtomicU64,
    total_uploaded: AtomicU64,
    download_rate: AtomicU64,
    upload_rate: AtomicU64,
    window_downloaded: AtomicU64,
    window_uploaded: AtomicU64,
    window: Mutex<Window>,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: AtomicU64::new(0),
            total_uploaded: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            window_downloaded: AtomicU64::new(0),
            window_uploaded: AtomicU64::new(0),
            window: Mutex::new(Window {
                last_update: Instant::now(),
                ema_download: 0.0,
                ema_upload: 0.0,
            }),
        }
    }
}

fn smooth(ema: f64, sample: f64) -> f64 {
    if ema == 0.0 {
        sample
    } else {
        EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * ema
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, bytes: u64) {
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.total_uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.total_uploaded.load(Ordering::Relaxed)
    }

    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Relaxed)
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_rate.load(Ordering::Relaxed)
    }

    /// Resume totals from persisted stats, rates are left alone.
    pub fn restore(&self, downloaded: u64, uploaded: u64) {
        self.total_downloaded.store(downloaded, Ordering::Relaxed);
        self.total_uploaded.store(uploaded, Ordering::Relaxed);
    }

    /// Fold the bytes recorded since the last call into the rates.
    pub fn update_rates(&self) {
        self.update_rates_at(Instant::now());
    }

    fn update_rates_at(&self, now: Instant) {
        let Ok(mut window) = self.window.lock() else { return };
        let elapsed = now.duration_since(window.last_update).as_secs_f64();

        // Minimum 1ms elapsed
        if elapsed < 0.001 {
            return;
        }

        let downloaded = self.window_downloaded.swap(0, Ordering::Relaxed);
        let uploaded = self.window_uploaded.swap(0, Ordering::Relaxed);

        window.ema_download =
            smooth(window.ema_download, downloaded as f64 / elapsed);
        window.ema_upload = smooth(window.ema_upload, uploaded as f64 / elapsed);
        window.last_update = now;

        self.download_rate
            .store(window.ema_download as u64, Ordering::Relaxed);
        self.upload_rate.store(window.ema_upload as u64, Ordering::Relaxed);
    }
}
