use crate::queue::{LeaseFilter, QueueItem};

/// Attempts above this are left for manual review.
pub const MANUAL_REVIEW_CEILING: u32 = 20;
/// Attempts above this wait one day plus an exponential term.
pub const SOFT_CEILING: u32 = 10;
/// Attempts at or above this wait one hour.
pub const COOLDOWN_FLOOR: u32 = 5;

const ONE_HOUR: u64 = 3_600;
const ONE_DAY: u64 = 86_400;

/// Backoff gate applied to a leased item before it is dispatched.
///
/// When disabled every item is eligible; attempt counts are still recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityGate {
    enabled: bool,
}

impl EligibilityGate {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_eligible(&self, item: &QueueItem, now: u64) -> bool {
        if !self.enabled {
            return true;
        }

        let count = item.attempt_count;
        let age = now.saturating_sub(item.creation_time);
        if count > MANUAL_REVIEW_CEILING {
            false
        } else if count > SOFT_CEILING {
            age > ONE_DAY + (1u64 << count)
        } else if count >= COOLDOWN_FLOOR {
            age > ONE_HOUR
        } else {
            true
        }
    }

    /// Tightens `filter` so poison items are never leased while gating is on.
    pub fn lease_filter(&self, filter: &LeaseFilter) -> LeaseFilter {
        if self.enabled {
            filter.clone().with_attempt_ceiling(MANUAL_REVIEW_CEILING)
        } else {
            filter.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueItemType;
    use serde_json::json;

    fn item(count: u32, creation: u64) -> QueueItem {
        let mut item = QueueItem::new(
            QueueItemType::Price,
            1,
            "0x0000000000000000000000000000000000000001",
            json!({}),
            None,
            creation,
        )
        .unwrap();
        item.attempt_count = count;
        item
    }

    #[test]
    fn test_fresh_items_always_eligible() {
        let gate = EligibilityGate::new(true);
        assert!(gate.is_eligible(&item(0, 100), 100));
        assert!(gate.is_eligible(&item(4, 100), 100));
    }

    #[test]
    fn test_flat_hour_cooldown() {
        let gate = EligibilityGate::new(true);
        assert!(!gate.is_eligible(&item(5, 0), ONE_HOUR));
        assert!(gate.is_eligible(&item(5, 0), ONE_HOUR + 1));
        assert!(gate.is_eligible(&item(10, 0), ONE_HOUR + 1));
    }

    #[test]
    fn test_exponential_cooldown() {
        let gate = EligibilityGate::new(true);
        let wait = ONE_DAY + (1 << 11);
        assert!(!gate.is_eligible(&item(11, 0), wait));
        assert!(gate.is_eligible(&item(11, 0), wait + 1));
        assert!(!gate.is_eligible(&item(20, 0), ONE_DAY + (1 << 19)));
    }

    #[test]
    fn test_manual_review_ceiling() {
        let gate = EligibilityGate::new(true);
        assert!(!gate.is_eligible(&item(21, 0), u64::MAX));
    }

    #[test]
    fn test_disabled_gate_admits_everything() {
        let gate = EligibilityGate::new(false);
        assert!(gate.is_eligible(&item(50, 0), 0));
        assert_eq!(gate.lease_filter(&LeaseFilter::any_attempts()).attempt_ceiling, None);
    }

    #[test]
    fn test_enabled_gate_caps_any_filter() {
        let gate = EligibilityGate::new(true);
        let filter = gate.lease_filter(&LeaseFilter::any_attempts());
        assert_eq!(filter.attempt_ceiling, Some(MANUAL_REVIEW_CEILING));
        assert!(!filter.matches(&item(21, 0)));
    }
}
