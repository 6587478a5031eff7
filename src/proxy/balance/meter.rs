use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    epoch: i64,
    ok: u64,
    failed: u64,
}

/// Sliding-window failure meter. Observations land in per-resolution
/// buckets; reads only count buckets that still fall inside the window,
/// so stale data ages out without an explicit rotation pass.
#[derive(Debug, Clone)]
pub struct RollingMeter {
    buckets: Vec<Bucket>,
    resolution: Duration,
    first_epoch: Option<i64>,
}

pub const DEFAULT_METER_BUCKETS: usize = 10;

impl RollingMeter {
    pub fn new(buckets: usize, resolution: Duration) -> Self {
        Self {
            buckets: vec![Bucket::default(); buckets.max(1)],
            resolution,
            first_epoch: None,
        }
    }

    fn epoch(&self, now: DateTime<Utc>) -> i64 {
        let resolution_ms = self.resolution.num_milliseconds().max(1);
        now.timestamp_millis().div_euclid(resolution_ms)
    }

    pub fn record(&mut self, success: bool, now: DateTime<Utc>) {
        let epoch = self.epoch(now);
        if self.first_epoch.is_none() {
            self.first_epoch = Some(epoch);
        }
        let len = self.buckets.len() as i64;
        let slot = &mut self.buckets[epoch.rem_euclid(len) as usize];
        if slot.epoch != epoch {
            *slot = Bucket {
                epoch,
                ok: 0,
                failed: 0,
            };
        }
        if success {
            slot.ok += 1;
        } else {
            slot.failed += 1;
        }
    }

    /// Fraction of observed attempts within the window that failed.
    /// Zero when nothing has been observed.
    pub fn fail_rate(&self, now: DateTime<Utc>) -> f64 {
        let epoch = self.epoch(now);
        let len = self.buckets.len() as i64;
        let (mut ok, mut failed) = (0u64, 0u64);
        for bucket in &self.buckets {
            if bucket.epoch > epoch - len && bucket.epoch <= epoch {
                ok += bucket.ok;
                failed += bucket.failed;
            }
        }
        let total = ok + failed;
        if total == 0 {
            return 0.0;
        }
        failed as f64 / total as f64
    }

    /// True once a full window has elapsed since the first observation.
    /// Weight adjustment stays dormant until every meter reports ready.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.first_epoch {
            Some(first) => self.epoch(now) - first >= self.buckets.len() as i64,
            None => false,
        }
    }

    pub fn window_size(&self) -> Duration {
        self.resolution * self.buckets.len() as i32
    }
}

impl Default for RollingMeter {
    fn default() -> Self {
        Self::new(DEFAULT_METER_BUCKETS, Duration::seconds(1))
    }
}
