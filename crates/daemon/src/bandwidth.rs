// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - Bandwidth Monitor
// Activity indicator: a fixed non-zero sample while connected, zero otherwise.
// No traffic is measured.

use std::future;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Interval between samples while monitoring
pub const BANDWIDTH_INTERVAL: Duration = Duration::from_secs(1);

/// Value reported in each direction while the tunnel is up (KB/s)
pub const ACTIVE_KBS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthSample {
    pub upload_kbs: f64,
    pub download_kbs: f64,
}

impl BandwidthSample {
    pub const IDLE: Self = Self {
        upload_kbs: 0.0,
        download_kbs: 0.0,
    };

    pub const ACTIVE: Self = Self {
        upload_kbs: ACTIVE_KBS,
        download_kbs: ACTIVE_KBS,
    };
}

#[derive(Debug)]
pub struct BandwidthMonitor {
    period: Duration,
    ticker: Option<Interval>,
}

impl BandwidthMonitor {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            ticker: None,
        }
    }

    /// Begin ticking; the first sample arrives one period from now
    pub fn start(&mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
    }

    /// Stop ticking and return the zero sample to publish
    pub fn stop(&mut self) -> BandwidthSample {
        self.ticker = None;
        BandwidthSample::IDLE
    }

    /// Next sample. Pending while monitoring is off.
    pub async fn tick(&mut self) -> BandwidthSample {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
                BandwidthSample::ACTIVE
            }
            None => future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_samples_while_active() {
        let mut monitor = BandwidthMonitor::new(BANDWIDTH_INTERVAL);
        monitor.start();

        let sample = monitor.tick().await;
        assert!(sample.upload_kbs > 0.0);
        assert!(sample.download_kbs > 0.0);
        assert_eq!(monitor.tick().await, BandwidthSample::ACTIVE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reports_zero_and_goes_quiet() {
        let mut monitor = BandwidthMonitor::new(BANDWIDTH_INTERVAL);
        monitor.start();
        monitor.tick().await;

        assert_eq!(monitor.stop(), BandwidthSample::IDLE);

        let next = tokio::time::timeout(Duration::from_secs(60), monitor.tick()).await;
        assert!(next.is_err());
    }
}
