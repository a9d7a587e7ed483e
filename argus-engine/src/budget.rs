//! Token budget accounting with rolling windows and priority reserves.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use argus_bus::{Bus, BusMessage, Topic};
use argus_types::{BudgetSnapshot, Priority};

/// Fraction of the hourly limit held back for critical-priority work.
const CRITICAL_RESERVE_FRACTION: u64 = 10;

/// Budget errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BudgetError {
    /// Admission refused: the projected total exceeds the window limit
    /// and no reserve applies.
    #[error("budget refused, retry in {retry_after_s}s")]
    Refused {
        /// Suggested wait before retrying.
        retry_after_s: u64,
    },
}

/// A granted reservation. Must be settled with actual usage when the
/// reserved call completes (pass `0` if nothing was consumed).
#[derive(Debug)]
pub struct Reservation {
    id: u64,
    /// Tokens reserved at admission.
    pub estimate: u64,
    /// Priority the reservation was granted at.
    pub priority: Priority,
}

#[derive(Debug)]
struct ReservationInfo {
    estimate: u64,
    from_reserve: bool,
}

#[derive(Debug, Default)]
struct BudgetState {
    /// Settled (timestamp, tokens, from_critical_reserve), hourly window.
    hourly: VecDeque<(DateTime<Utc>, u64, bool)>,
    /// Settled (timestamp, tokens), daily window.
    daily: VecDeque<(DateTime<Utc>, u64)>,
    /// In-flight reservations by token id.
    reservations: HashMap<u64, ReservationInfo>,
    /// Sliding per-priority request timestamps (hourly window).
    requests: HashMap<Priority, VecDeque<DateTime<Utc>>>,
    next_id: u64,
}

impl BudgetState {
    fn prune(&mut self, now: DateTime<Utc>) {
        let hour_cutoff = now - Duration::hours(1);
        while self.hourly.front().is_some_and(|(t, _, _)| *t < hour_cutoff) {
            self.hourly.pop_front();
        }
        let day_cutoff = now - Duration::days(1);
        while self.daily.front().is_some_and(|(t, _)| *t < day_cutoff) {
            self.daily.pop_front();
        }
        for window in self.requests.values_mut() {
            while window.front().is_some_and(|t| *t < hour_cutoff) {
                window.pop_front();
            }
        }
    }

    fn hourly_used(&self) -> u64 {
        self.hourly.iter().map(|(_, tokens, _)| tokens).sum()
    }

    fn daily_used(&self) -> u64 {
        self.daily.iter().map(|(_, tokens)| tokens).sum()
    }

    fn reserved(&self) -> u64 {
        self.reservations.values().map(|r| r.estimate).sum()
    }

    fn critical_used(&self) -> u64 {
        self.hourly
            .iter()
            .filter(|(_, _, from_reserve)| *from_reserve)
            .map(|(_, tokens, _)| tokens)
            .sum::<u64>()
            + self
                .reservations
                .values()
                .filter(|r| r.from_reserve)
                .map(|r| r.estimate)
                .sum::<u64>()
    }
}

/// Process-wide token budget.
///
/// Single owner with a serialized interior; reserve/settle are
/// sub-millisecond and every change publishes `budget.update`.
pub struct BudgetManager {
    state: Mutex<BudgetState>,
    hourly_limit: u64,
    daily_limit: u64,
    bus: Bus,
}

impl BudgetManager {
    /// Create a manager with the given window limits.
    pub fn new(hourly_limit: u64, daily_limit: u64, bus: Bus) -> Self {
        Self {
            state: Mutex::new(BudgetState::default()),
            hourly_limit,
            daily_limit,
            bus,
        }
    }

    /// Tokens held back for critical work.
    pub fn critical_reserve(&self) -> u64 {
        self.hourly_limit / CRITICAL_RESERVE_FRACTION
    }

    /// Atomically reserve `estimate` tokens at `priority`.
    ///
    /// Refused requests reserve nothing. A refused non-critical request
    /// may still leave headroom for `Critical` callers, which can dip
    /// into the critical reserve.
    pub fn reserve(&self, priority: Priority, estimate: u64) -> Result<Reservation, BudgetError> {
        let now = Utc::now();
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.prune(now);
            state.requests.entry(priority).or_default().push_back(now);

            let hourly_projected = state.hourly_used() + state.reserved() + estimate;
            let daily_projected = state.daily_used() + state.reserved() + estimate;
            let within_windows =
                hourly_projected <= self.hourly_limit && daily_projected <= self.daily_limit;

            let from_reserve = if within_windows {
                false
            } else if priority == Priority::Critical
                && state.critical_used() + estimate <= self.critical_reserve()
            {
                true
            } else {
                return Err(BudgetError::Refused {
                    retry_after_s: self.retry_hint(&state, now),
                });
            };

            state.next_id += 1;
            let id = state.next_id;
            state
                .reservations
                .insert(id, ReservationInfo { estimate, from_reserve });
            let snapshot = self.snapshot_locked(&state);
            drop(state);
            (id, snapshot)
        };
        let (id, snap) = snapshot;
        self.bus.publish(Topic::BudgetUpdate, BusMessage::Budget(snap));
        Ok(Reservation {
            id,
            estimate,
            priority,
        })
    }

    /// Replace a reservation with the actual usage.
    ///
    /// Overshoot (actual > estimate) is always accepted; the inflated
    /// window simply refuses the next admission.
    pub fn settle(&self, reservation: Reservation, actual: u64) {
        let now = Utc::now();
        let snap = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.prune(now);
            let from_reserve = state
                .reservations
                .remove(&reservation.id)
                .map(|info| info.from_reserve)
                .unwrap_or(false);
            if actual > 0 {
                state.hourly.push_back((now, actual, from_reserve));
                state.daily.push_back((now, actual));
            }
            self.snapshot_locked(&state)
        };
        self.bus.publish(Topic::BudgetUpdate, BusMessage::Budget(snap));
    }

    /// Current counters.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.prune(Utc::now());
        self.snapshot_locked(&state)
    }

    /// Requests admitted or refused at `priority` in the last hour.
    pub fn requests_in_window(&self, priority: Priority) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.prune(Utc::now());
        state.requests.get(&priority).map_or(0, |w| w.len())
    }

    fn snapshot_locked(&self, state: &BudgetState) -> BudgetSnapshot {
        BudgetSnapshot {
            hourly_used: state.hourly_used(),
            hourly_limit: self.hourly_limit,
            daily_used: state.daily_used(),
            daily_limit: self.daily_limit,
            reserved: state.reserved(),
            critical_used: state.critical_used(),
            critical_reserve: self.critical_reserve(),
        }
    }

    /// Seconds until the oldest hourly entry ages out, as a retry hint.
    fn retry_hint(&self, state: &BudgetState, now: DateTime<Utc>) -> u64 {
        state
            .hourly
            .front()
            .map(|(t, _, _)| {
                let expiry = *t + Duration::hours(1);
                (expiry - now).num_seconds().max(1) as u64
            })
            .unwrap_or(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(hourly: u64, daily: u64) -> BudgetManager {
        BudgetManager::new(hourly, daily, Bus::new())
    }

    #[test]
    fn reserve_then_settle_replaces_estimate() {
        let budget = manager(1000, 10_000);
        let reservation = budget.reserve(Priority::Routine, 200).unwrap();
        assert_eq!(budget.snapshot().reserved, 200);
        assert_eq!(budget.snapshot().hourly_used, 0);

        budget.settle(reservation, 150);
        let snap = budget.snapshot();
        assert_eq!(snap.reserved, 0);
        assert_eq!(snap.hourly_used, 150);
    }

    #[test]
    fn refused_request_reserves_nothing() {
        let budget = manager(1000, 10_000);
        let reservation = budget.reserve(Priority::Routine, 990).unwrap();
        budget.settle(reservation, 990);

        let refused = budget.reserve(Priority::Routine, 100);
        assert!(matches!(refused, Err(BudgetError::Refused { .. })));
        let snap = budget.snapshot();
        assert_eq!(snap.hourly_used, 990, "counters untouched by refusal");
        assert_eq!(snap.reserved, 0);
    }

    #[test]
    fn critical_dips_into_reserve() {
        let budget = manager(1000, 10_000);
        let reservation = budget.reserve(Priority::Routine, 1000).unwrap();
        budget.settle(reservation, 1000);

        // Window exhausted: routine refused, critical admitted from the
        // 10% reserve.
        assert!(budget.reserve(Priority::Urgent, 50).is_err());
        let critical = budget.reserve(Priority::Critical, 50).unwrap();
        assert_eq!(budget.snapshot().critical_used, 50);
        budget.settle(critical, 50);

        // The reserve itself is bounded.
        assert!(budget.reserve(Priority::Critical, 100).is_err());
    }

    #[test]
    fn overshoot_accepted_then_next_admission_refused() {
        let budget = manager(1000, 10_000);
        let reservation = budget.reserve(Priority::Routine, 100).unwrap();
        // Actual far above the estimate is accounted, not rejected.
        budget.settle(reservation, 2000);
        assert_eq!(budget.snapshot().hourly_used, 2000);
        assert!(budget.reserve(Priority::Routine, 1).is_err());
    }

    #[test]
    fn settle_with_zero_consumes_nothing() {
        let budget = manager(1000, 10_000);
        let reservation = budget.reserve(Priority::Routine, 400).unwrap();
        budget.settle(reservation, 0);
        let snap = budget.snapshot();
        assert_eq!(snap.hourly_used, 0);
        assert_eq!(snap.reserved, 0);
    }

    #[test]
    fn daily_limit_caps_admission() {
        let budget = manager(10_000, 1000);
        let reservation = budget.reserve(Priority::Routine, 900).unwrap();
        budget.settle(reservation, 900);
        assert!(budget.reserve(Priority::Routine, 200).is_err());
    }

    #[test]
    fn budget_updates_published() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(Topic::BudgetUpdate);
        let budget = BudgetManager::new(1000, 10_000, bus);

        let reservation = budget.reserve(Priority::Routine, 10).unwrap();
        budget.settle(reservation, 10);

        let mut updates = 0;
        while let Some(BusMessage::Budget(_)) = sub.try_recv() {
            updates += 1;
        }
        assert_eq!(updates, 2, "one per reserve, one per settle");
    }

    #[test]
    fn request_counter_tracks_priority() {
        let budget = manager(1000, 10_000);
        let r = budget.reserve(Priority::Urgent, 1).unwrap();
        budget.settle(r, 1);
        let _ = budget.reserve(Priority::Urgent, 5000); // refused, still counted
        assert_eq!(budget.requests_in_window(Priority::Urgent), 2);
        assert_eq!(budget.requests_in_window(Priority::Routine), 0);
    }
}
