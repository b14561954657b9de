//! In-memory request governance: a sliding-window log per principal and
//! bucket, plus a per-principal in-flight counter.

use std::{
    collections::VecDeque,
    fmt,
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{GovernorError, Result};
use crate::ids::TenantId;
use crate::settings::{RateLimitSettings, WindowLimit};

/// Who a request is accounted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    /// Authenticated tenant.
    Tenant(TenantId),
    /// Anonymous caller, by client address.
    Address(IpAddr),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tenant(tenant) => write!(f, "tenant:{tenant}"),
            Self::Address(addr) => write!(f, "ip:{addr}"),
        }
    }
}

/// Request class with its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    /// Everything not marked expensive.
    General,
    /// Runs, seeds, queries and log streams.
    Expensive,
}

impl fmt::Display for BucketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::General => "general",
            Self::Expensive => "expensive",
        })
    }
}

/// Outcome of [`RateLimiter::prune`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Windows dropped because they became empty.
    pub windows_removed: usize,
    /// Timestamps that fell out of their window.
    pub timestamps_removed: usize,
    /// Windows still tracked.
    pub windows_retained: usize,
}

/// Current limiter occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    /// Tracked (principal, bucket) windows.
    pub windows: usize,
    /// Principals with at least one request in flight.
    pub principals_in_flight: usize,
    /// Requests in flight across all principals.
    pub requests_in_flight: usize,
}

type InFlight = Arc<DashMap<Principal, usize>>;

/// Sliding-window rate gate and per-principal concurrency gate.
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    windows: DashMap<(Principal, BucketKind), VecDeque<Instant>>,
    in_flight: InFlight,
}

impl RateLimiter {
    /// Limiter with no recorded history.
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            windows: DashMap::new(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Settings the limiter enforces.
    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// False when limiting is switched off in the settings.
    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Bucket a request path counts against.
    pub fn classify(&self, path: &str) -> BucketKind {
        let expensive = self
            .settings
            .expensive_path_markers
            .iter()
            .any(|marker| path.contains(marker.as_str()));
        if expensive {
            BucketKind::Expensive
        } else {
            BucketKind::General
        }
    }

    /// [`Self::check_rate_at`] with the current time.
    pub fn check_rate(&self, principal: &Principal, bucket: BucketKind) -> Result<()> {
        self.check_rate_at(principal, bucket, Instant::now())
    }

    /// Record a request at `now`, or reject it when the window already holds
    /// `limit` requests. Rejected requests are not recorded.
    pub fn check_rate_at(
        &self,
        principal: &Principal,
        bucket: BucketKind,
        now: Instant,
    ) -> Result<()> {
        let bucket_limit = self.limit_for(bucket);
        let (limit, window) = (bucket_limit.limit, bucket_limit.window());

        let mut log = self
            .windows
            .entry((principal.clone(), bucket))
            .or_default();
        evict_before(&mut log, now, window);

        if log.len() >= limit {
            let retry_after = log
                .front()
                .map(|oldest| (*oldest + window).saturating_duration_since(now))
                .unwrap_or(window);
            drop(log);
            warn!(
                principal = %principal,
                bucket = %bucket,
                limit,
                retry_after_secs = retry_after.as_secs(),
                "rate limit exceeded"
            );
            return Err(GovernorError::RateLimitExceeded {
                bucket,
                limit,
                window,
                retry_after,
            });
        }

        log.push_back(now);
        Ok(())
    }

    /// Count a request as in flight until the returned guard is dropped.
    pub fn enter(&self, principal: &Principal) -> Result<InFlightGuard> {
        let limit = self.settings.max_concurrent_requests;
        {
            let mut count = self.in_flight.entry(principal.clone()).or_insert(0);
            if *count >= limit {
                let current = *count;
                drop(count);
                warn!(
                    principal = %principal,
                    in_flight = current,
                    limit,
                    "concurrent request limit exceeded"
                );
                return Err(GovernorError::ConcurrencyLimitExceeded { limit });
            }
            *count += 1;
        }

        Ok(InFlightGuard {
            principal: principal.clone(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Rate gate, then concurrency gate.
    pub fn admit(&self, principal: &Principal, bucket: BucketKind) -> Result<InFlightGuard> {
        self.check_rate(principal, bucket)?;
        self.enter(principal)
    }

    /// Requests the principal currently has in flight.
    pub fn in_flight(&self, principal: &Principal) -> usize {
        self.in_flight.get(principal).map_or(0, |count| *count)
    }

    /// Drop timestamps that fell out of their window and windows left empty.
    pub fn prune(&self, now: Instant) -> PruneReport {
        let mut report = PruneReport::default();

        self.windows.retain(|(_, bucket), log| {
            let window = self.limit_for(*bucket).window();
            report.timestamps_removed += evict_before(log, now, window);
            if log.is_empty() {
                report.windows_removed += 1;
                false
            } else {
                true
            }
        });
        report.windows_retained = self.windows.len();

        // Guards remove their own entries; this only catches stragglers.
        self.in_flight.retain(|_, count| *count > 0);

        if report.windows_removed > 0 {
            info!(
                windows_removed = report.windows_removed,
                timestamps_removed = report.timestamps_removed,
                windows_retained = report.windows_retained,
                "pruned rate limit windows"
            );
        } else {
            debug!(windows_retained = report.windows_retained, "rate limit windows pruned");
        }
        report
    }

    /// Current occupancy.
    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            windows: self.windows.len(),
            principals_in_flight: self.in_flight.len(),
            requests_in_flight: self.in_flight.iter().map(|e| *e.value()).sum(),
        }
    }

    fn limit_for(&self, bucket: BucketKind) -> WindowLimit {
        match bucket {
            BucketKind::General => self.settings.general,
            BucketKind::Expensive => self.settings.expensive,
        }
    }
}

/// Removes timestamps at or before `now - window`; returns how many.
fn evict_before(log: &mut VecDeque<Instant>, now: Instant, window: Duration) -> usize {
    let mut evicted = 0;
    while let Some(oldest) = log.front() {
        if now.saturating_duration_since(*oldest) >= window {
            log.pop_front();
            evicted += 1;
        } else {
            break;
        }
    }
    evicted
}

/// Releases one in-flight slot on drop, however the request ended.
#[must_use = "the request stops counting as in flight when the guard drops"]
pub struct InFlightGuard {
    principal: Principal,
    in_flight: InFlight,
}

impl fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.in_flight.get_mut(&self.principal) {
            *count = count.saturating_sub(1);
        }
        self.in_flight.remove_if(&self.principal, |_, count| *count == 0);
    }
}
