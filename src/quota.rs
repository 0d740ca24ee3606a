//! Per-user request and bandwidth quotas
//!
//! Each user gets a fixed window during which request count, uploaded bytes
//! and downloaded bytes are capped. Windows reset lazily: the first request
//! after the interval has elapsed starts a fresh window.

use crate::protocol::Status;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Configured caps for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub interval: Duration,
    pub requests: u64,
    pub upload: u64,
    pub download: u64,
}

/// Bytes a request intends to move in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Demand {
    pub upload: u64,
    pub download: u64,
}

impl Demand {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn upload(bytes: usize) -> Self {
        Self {
            upload: bytes as u64,
            download: 0,
        }
    }

    pub fn download(bytes: usize) -> Self {
        Self {
            upload: 0,
            download: bytes as u64,
        }
    }
}

/// Which cap a request ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDenied {
    Requests,
    Upload,
    Download,
}

impl From<QuotaDenied> for Status {
    fn from(denied: QuotaDenied) -> Self {
        match denied {
            QuotaDenied::Requests => Status::ErrQuotaReq,
            QuotaDenied::Upload => Status::ErrQuotaUp,
            QuotaDenied::Download => Status::ErrQuotaDown,
        }
    }
}

/// Usage within the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaState {
    pub window_start: Instant,
    pub requests: u64,
    pub uploaded: u64,
    pub downloaded: u64,
}

impl QuotaState {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            requests: 0,
            uploaded: 0,
            downloaded: 0,
        }
    }

    /// Check `demand` against `limits` and charge it if every cap holds.
    ///
    /// Checks run in order: window reset, request count, upload, download.
    /// A rejection leaves the counters untouched.
    pub fn admit(
        &mut self,
        limits: &QuotaLimits,
        demand: Demand,
        now: Instant,
    ) -> Result<(), QuotaDenied> {
        if now.saturating_duration_since(self.window_start) >= limits.interval {
            *self = QuotaState::new(now);
        }
        if self.requests >= limits.requests {
            return Err(QuotaDenied::Requests);
        }
        if self.uploaded.saturating_add(demand.upload) > limits.upload {
            return Err(QuotaDenied::Upload);
        }
        if self.downloaded.saturating_add(demand.download) > limits.download {
            return Err(QuotaDenied::Download);
        }
        self.requests += 1;
        self.uploaded += demand.upload;
        self.downloaded += demand.download;
        Ok(())
    }
}

/// Quota state for every user that has made a gated request
pub struct QuotaEnforcer {
    limits: QuotaLimits,
    states: Mutex<HashMap<String, QuotaState>>,
}

impl QuotaEnforcer {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            states: Mutex::new(HashMap::new()),
        }
    }


    pub fn admit(&self, user: &str, demand: Demand) -> Result<(), QuotaDenied> {
        self.admit_at(user, demand, Instant::now())
    }

    pub fn admit_at(&self, user: &str, demand: Demand, now: Instant) -> Result<(), QuotaDenied> {
        let mut states = self.states.lock();
        states
            .entry(user.to_string())
            .or_insert_with(|| QuotaState::new(now))
            .admit(&self.limits, demand, now)
    }

    /// Current usage for `user`, if any
    #[cfg(test)]
    pub(crate) fn usage(&self, user: &str) -> Option<QuotaState> {
        self.states.lock().get(user).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> QuotaLimits {
        QuotaLimits {
            interval: Duration::from_secs(10),
            requests: 3,
            upload: 100,
            download: 50,
        }
    }

    #[test]
    fn test_request_cap() {
        let quota = QuotaEnforcer::new(limits());
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(quota.admit_at("alice", Demand::none(), now), Ok(()));
        }
        assert_eq!(
            quota.admit_at("alice", Demand::none(), now),
            Err(QuotaDenied::Requests)
        );
        assert_eq!(quota.usage("alice").unwrap().requests, 3);

        // Other users are independent
        assert_eq!(quota.admit_at("bob", Demand::none(), now), Ok(()));
    }

    #[test]
    fn test_upload_cap_is_inclusive_and_rejection_is_free() {
        let quota = QuotaEnforcer::new(limits());
        let now = Instant::now();

        assert_eq!(quota.admit_at("alice", Demand::upload(60), now), Ok(()));
        assert_eq!(
            quota.admit_at("alice", Demand::upload(41), now),
            Err(QuotaDenied::Upload)
        );
        let usage = quota.usage("alice").unwrap();
        assert_eq!(usage.requests, 1);
        assert_eq!(usage.uploaded, 60);

        assert_eq!(quota.admit_at("alice", Demand::upload(40), now), Ok(()));
        assert_eq!(quota.usage("alice").unwrap().uploaded, 100);
    }

    #[test]
    fn test_download_cap() {
        let quota = QuotaEnforcer::new(limits());
        let now = Instant::now();
        assert_eq!(quota.admit_at("alice", Demand::download(50), now), Ok(()));
        assert_eq!(
            quota.admit_at("alice", Demand::download(1), now),
            Err(QuotaDenied::Download)
        );
        assert_eq!(quota.admit_at("alice", Demand::download(0), now), Ok(()));
    }

    #[test]
    fn test_request_cap_checked_before_bytes() {
        let quota = QuotaEnforcer::new(QuotaLimits {
            requests: 1,
            ..limits()
        });
        let now = Instant::now();
        quota.admit_at("alice", Demand::none(), now).unwrap();
        assert_eq!(
            quota.admit_at("alice", Demand::upload(1000), now),
            Err(QuotaDenied::Requests)
        );
    }

    #[test]
    fn test_window_resets_after_interval() {
        let quota = QuotaEnforcer::new(limits());
        let start = Instant::now();
        for _ in 0..3 {
            quota.admit_at("alice", Demand::upload(30), start).unwrap();
        }
        let almost = start + Duration::from_millis(9_999);
        assert_eq!(
            quota.admit_at("alice", Demand::none(), almost),
            Err(QuotaDenied::Requests)
        );

        let later = start + Duration::from_secs(10);
        for _ in 0..3 {
            assert_eq!(quota.admit_at("alice", Demand::upload(30), later), Ok(()));
        }
        let usage = quota.usage("alice").unwrap();
        assert_eq!(usage.window_start, later);
        assert_eq!(usage.uploaded, 90);
    }

    #[test]
    fn test_denials_map_to_status_tokens() {
        assert_eq!(Status::from(QuotaDenied::Requests), Status::ErrQuotaReq);
        assert_eq!(Status::from(QuotaDenied::Upload), Status::ErrQuotaUp);
        assert_eq!(Status::from(QuotaDenied::Download), Status::ErrQuotaDown);
    }
}
