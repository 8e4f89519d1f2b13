// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

const SMOOTHING_PERIOD_MS: f64 = 5000.0;

/// Rates below this are considered idle and dropped from the rate map.
const IDLE_RATE_BPS: f64 = 1.0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteCounts {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// Smoothed transfer rates in bytes per second.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct FileRates {
    pub upload_bps: f64,
    pub download_bps: f64,
}

/// Per-file byte accumulators fed by the framer, plus the smoothed rates
/// derived from them on every `sample`.
#[derive(Debug, Default)]
pub struct BandwidthTracker {
    accumulators: Mutex<HashMap<String, ByteCounts>>,
    rates: Mutex<HashMap<String, FileRates>>,
}

impl BandwidthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_upload(&self, file_hash: &str, bytes: u64) {
        let mut accumulators = self.accumulators.lock().unwrap_or_else(|e| e.into_inner());
        accumulators.entry(file_hash.to_string()).or_default().uploaded += bytes;
    }

    pub fn record_download(&self, file_hash: &str, bytes: u64) {
        let mut accumulators = self.accumulators.lock().unwrap_or_else(|e| e.into_inner());
        accumulators.entry(file_hash.to_string()).or_default().downloaded += bytes;
    }

    /// Bytes accumulated for a file since the last drain.
    pub fn snapshot(&self, file_hash: &str) -> ByteCounts {
        let accumulators = self.accumulators.lock().unwrap_or_else(|e| e.into_inner());
        accumulators.get(file_hash).copied().unwrap_or_default()
    }

    /// Takes every accumulator and resets them to zero.
    pub fn drain(&self) -> HashMap<String, ByteCounts> {
        let mut accumulators = self.accumulators.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *accumulators)
    }

    /// Drains the accumulators and folds them into the per-file moving average.
    pub fn sample(&self, elapsed: Duration) -> HashMap<String, FileRates> {
        let ticks = self.drain();

        let dt_ms = elapsed.as_millis() as f64;
        let scaling_factor = if dt_ms > 0.0 { 1000.0 / dt_ms } else { 1.0 };
        let alpha = 1.0 - (-dt_ms / SMOOTHING_PERIOD_MS).exp();

        let mut rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());
        for file_hash in ticks.keys() {
            rates.entry(file_hash.clone()).or_default();
        }

        rates.retain(|file_hash, rate| {
            let tick = ticks.get(file_hash).copied().unwrap_or_default();
            let inst_ul = tick.uploaded as f64 * scaling_factor;
            let inst_dl = tick.downloaded as f64 * scaling_factor;

            rate.upload_bps = (inst_ul * alpha) + (rate.upload_bps * (1.0 - alpha));
            rate.download_bps = (inst_dl * alpha) + (rate.download_bps * (1.0 - alpha));

            let active = tick.uploaded > 0 || tick.downloaded > 0;
            active || rate.upload_bps >= IDLE_RATE_BPS || rate.download_bps >= IDLE_RATE_BPS
        });

        rates.clone()
    }

    pub fn rates(&self) -> HashMap<String, FileRates> {
        self.rates.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
