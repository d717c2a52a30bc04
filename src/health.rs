use crate::{AdmissionStats, BrowserPoolStats, CacheStats, RenderService, ServiceStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

/// Point-in-time view of the engine for `/health/details`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthLevel,
    pub pool_status: HealthLevel,
    pub queue_status: HealthLevel,
    pub cache_status: HealthLevel,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: ServiceStats,
}

impl HealthSnapshot {
    pub fn capture(service: &RenderService) -> Self {
        Self::from_stats(service.stats())
    }

    pub fn from_stats(stats: ServiceStats) -> Self {
        let pool_status = pool_health(&stats.pool);
        let queue_status = queue_health(&stats.admission);
        let cache_status = cache_health(&stats.cache);
        let status = pool_status.max(queue_status).max(cache_status);

        if status == HealthLevel::Critical {
            warn!(
                "Health critical: pool {:?}, queue {:?}, cache {:?}",
                pool_status, queue_status, cache_status
            );
        }

        Self {
            status,
            pool_status,
            queue_status,
            cache_status,
            timestamp: Utc::now(),
            stats,
        }
    }
}

fn pool_health(pool: &BrowserPoolStats) -> HealthLevel {
    if pool.shutting_down {
        HealthLevel::Critical
    } else if pool.leased >= pool.capacity {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

fn queue_health(admission: &AdmissionStats) -> HealthLevel {
    // more waiters than the admission ceiling
    if admission.queued > admission.max_active {
        HealthLevel::Critical
    } else if admission.queued > 0 {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

fn cache_health(cache: &CacheStats) -> HealthLevel {
    if cache.max_bytes > 0 && cache.bytes * 10 >= cache.max_bytes * 9 {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> ServiceStats {
        ServiceStats {
            pool: BrowserPoolStats {
                capacity: 2,
                idle: 1,
                leased: 0,
                launched: 1,
                recycled: 0,
                destroyed: 0,
                shutting_down: false,
            },
            admission: AdmissionStats {
                active: 0,
                queued: 0,
                max_active: 2,
                oldest_deadline_ms: None,
            },
            cache: CacheStats {
                entries: 0,
                bytes: 0,
                max_entries: 50,
                max_bytes: 1000,
            },
            uptime_secs: 10,
        }
    }

    #[test]
    fn test_idle_engine_is_healthy() {
        let snapshot = HealthSnapshot::from_stats(stats());
        assert_eq!(snapshot.status, HealthLevel::Healthy);
    }

    #[test]
    fn test_worst_component_wins() {
        let mut s = stats();
        s.pool.leased = 2;
        s.admission.queued = 3;
        let snapshot = HealthSnapshot::from_stats(s);
        assert_eq!(snapshot.pool_status, HealthLevel::Warning);
        assert_eq!(snapshot.queue_status, HealthLevel::Critical);
        assert_eq!(snapshot.status, HealthLevel::Critical);
    }

    #[test]
    fn test_nearly_full_cache_warns() {
        let mut s = stats();
        s.cache.bytes = 950;
        assert_eq!(HealthSnapshot::from_stats(s).cache_status, HealthLevel::Warning);
    }

    #[test]
    fn test_snapshot_serializes_flat_stats() {
        let value = serde_json::to_value(HealthSnapshot::from_stats(stats())).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["pool"]["capacity"], 2);
        assert!(value["timestamp"].is_string());
    }
}
