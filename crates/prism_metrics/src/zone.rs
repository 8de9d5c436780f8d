//! Process-wide zone counters
//!
//! Zones are named scopes (one per pipeline phase) that accumulate hit counts
//! and wall time. The registry is shared so tooling can read every thread's
//! zones from one place.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneStats {
    pub hits: u64,
    pub total: Duration,
}

static ZONES: Lazy<Mutex<HashMap<&'static str, ZoneStats>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// RAII guard recording one zone hit on drop.
pub struct ZoneGuard {
    name: &'static str,
    start: Instant,
}

impl ZoneGuard {
    pub fn enter(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for ZoneGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let mut zones = ZONES.lock();
        let stats = zones.entry(self.name).or_default();
        stats.hits += 1;
        stats.total += elapsed;
    }
}

pub fn zone_stats(name: &str) -> ZoneStats {
    ZONES.lock().get(name).copied().unwrap_or_default()
}

pub fn reset_zones() {
    ZONES.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zones_accumulate_hits() {
        reset_zones();
        {
            let _z = ZoneGuard::enter("test_zone_a");
        }
        {
            let _z = ZoneGuard::enter("test_zone_a");
        }
        assert_eq!(zone_stats("test_zone_a").hits, 2);
        assert_eq!(zone_stats("missing_zone").hits, 0);
    }
}
