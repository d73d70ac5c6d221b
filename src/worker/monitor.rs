use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::error::MonitorError;

/// Identity of one worker slot inside a pool.
pub type SlotId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    /// Never reported since the pool started.
    Unknown,
    Idle,
    Busy,
}

/// Runner-level view: IDLE while any slot is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateStatus {
    Idle,
    Busy,
}

/// Pool-level view: FULL when every slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolStatus {
    Accepting,
    Full,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolStatus::Accepting => write!(f, "accepting"),
            PoolStatus::Full => write!(f, "full"),
        }
    }
}

/// Edge callbacks fired when the aggregate status flips.
///
/// Called while the monitor lock is held, so implementations must be quick
/// and must not call back into the monitor.
pub trait StatusListener: Send + Sync {
    fn on_idle(&self, previous: AggregateStatus);
    fn on_busy(&self, previous: AggregateStatus);
}

struct MonitorState {
    slots: Vec<SlotStatus>,
    aggregate: AggregateStatus,
    pool: PoolStatus,
    listeners: Vec<Arc<dyn StatusListener>>,
}

impl MonitorState {
    fn count(&self, status: SlotStatus) -> usize {
        self.slots.iter().filter(|s| **s == status).count()
    }

    fn compute_aggregate(&self) -> AggregateStatus {
        if self.slots.contains(&SlotStatus::Idle) {
            AggregateStatus::Idle
        } else {
            AggregateStatus::Busy
        }
    }

    fn compute_pool(&self) -> PoolStatus {
        if self.count(SlotStatus::Busy) == self.slots.len() {
            PoolStatus::Full
        } else {
            PoolStatus::Accepting
        }
    }
}

/// Status table of a pool's worker slots.
///
/// Slot statuses, the IDLE/BUSY aggregate and the ACCEPTING/FULL pool flag
/// all change under one lock, and both derived values are published on watch
/// channels for async consumers (heartbeat, job feeder).
pub struct StatusMonitor {
    state: Mutex<MonitorState>,
    aggregate_tx: watch::Sender<AggregateStatus>,
    pool_tx: watch::Sender<PoolStatus>,
}

impl StatusMonitor {
    pub fn new(capacity: usize) -> Self {
        let state = MonitorState {
            slots: vec![SlotStatus::Unknown; capacity],
            aggregate: AggregateStatus::Busy,
            pool: PoolStatus::Accepting,
            listeners: Vec::new(),
        };
        let pool = state.compute_pool();
        let (aggregate_tx, _) = watch::channel(AggregateStatus::Busy);
        let (pool_tx, _) = watch::channel(pool);
        Self {
            state: Mutex::new(MonitorState { pool, ..state }),
            aggregate_tx,
            pool_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_listener(&self, listener: Arc<dyn StatusListener>) {
        self.lock().listeners.push(listener);
    }

    /// Record a slot's status and fire edge callbacks if the aggregate flipped.
    pub fn status_for(
        &self,
        slot: SlotId,
        status: SlotStatus,
    ) -> Result<AggregateStatus, MonitorError> {
        if status == SlotStatus::Unknown {
            return Err(MonitorError::UnknownNotAssignable);
        }
        let mut state = self.lock();
        let entry = state
            .slots
            .get_mut(slot)
            .ok_or(MonitorError::UnknownSlot(slot))?;
        *entry = status;

        let previous = state.aggregate;
        let aggregate = state.compute_aggregate();
        if aggregate != previous {
            state.aggregate = aggregate;
            tracing::debug!(slot, ?previous, ?aggregate, "Runner status changed");
            for listener in &state.listeners {
                match aggregate {
                    AggregateStatus::Idle => listener.on_idle(previous),
                    AggregateStatus::Busy => listener.on_busy(previous),
                }
            }
            self.aggregate_tx.send_replace(aggregate);
        }

        let pool = state.compute_pool();
        if pool != state.pool {
            state.pool = pool;
            tracing::debug!(slot, status = %pool, "Pool status changed");
            self.pool_tx.send_replace(pool);
        }

        Ok(aggregate)
    }

    pub fn aggregate(&self) -> AggregateStatus {
        self.lock().aggregate
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.lock().pool
    }

    pub fn status_of(&self, slot: SlotId) -> Option<SlotStatus> {
        self.lock().slots.get(slot).copied()
    }

    pub fn count(&self, status: SlotStatus) -> usize {
        self.lock().count(status)
    }

    pub fn idle_slots(&self) -> Vec<SlotId> {
        self.lock()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == SlotStatus::Idle)
            .map(|(slot, _)| slot)
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn watch_aggregate(&self) -> watch::Receiver<AggregateStatus> {
        self.aggregate_tx.subscribe()
    }

    pub fn watch_pool(&self) -> watch::Receiver<PoolStatus> {
        self.pool_tx.subscribe()
    }
}

impl std::fmt::Debug for StatusMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("StatusMonitor")
            .field("slots", &state.slots)
            .field("aggregate", &state.aggregate)
            .field("pool", &state.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Edges {
        seen: Mutex<Vec<(&'static str, AggregateStatus)>>,
    }

    impl StatusListener for Edges {
        fn on_idle(&self, previous: AggregateStatus) {
            self.seen.lock().unwrap().push(("idle", previous));
        }

        fn on_busy(&self, previous: AggregateStatus) {
            self.seen.lock().unwrap().push(("busy", previous));
        }
    }

    fn monitor_with_edges(capacity: usize) -> (StatusMonitor, Arc<Edges>) {
        let monitor = StatusMonitor::new(capacity);
        let edges = Arc::new(Edges::default());
        monitor.add_listener(edges.clone());
        (monitor, edges)
    }

    #[test]
    fn starts_busy_until_a_slot_reports() {
        let monitor = StatusMonitor::new(2);
        assert_eq!(monitor.aggregate(), AggregateStatus::Busy);
        assert_eq!(monitor.pool_status(), PoolStatus::Accepting);
        assert_eq!(monitor.status_of(0), Some(SlotStatus::Unknown));
    }

    #[test]
    fn rejects_unknown_slot_and_explicit_unknown() {
        let monitor = StatusMonitor::new(1);
        assert_eq!(
            monitor.status_for(5, SlotStatus::Idle),
            Err(MonitorError::UnknownSlot(5))
        );
        assert_eq!(
            monitor.status_for(0, SlotStatus::Unknown),
            Err(MonitorError::UnknownNotAssignable)
        );
    }

    #[test]
    fn repeated_status_fires_once() {
        let (monitor, edges) = monitor_with_edges(1);
        monitor.status_for(0, SlotStatus::Idle).unwrap();
        monitor.status_for(0, SlotStatus::Idle).unwrap();
        assert_eq!(
            *edges.seen.lock().unwrap(),
            vec![("idle", AggregateStatus::Busy)]
        );
    }

    #[test]
    fn alternating_status_fires_per_change() {
        let (monitor, edges) = monitor_with_edges(1);
        for _ in 0..3 {
            monitor.status_for(0, SlotStatus::Idle).unwrap();
            monitor.status_for(0, SlotStatus::Busy).unwrap();
        }
        let seen = edges.seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], ("idle", AggregateStatus::Busy));
        assert_eq!(seen[1], ("busy", AggregateStatus::Idle));
        assert_eq!(seen[5], ("busy", AggregateStatus::Idle));
    }

    #[test]
    fn one_idle_slot_keeps_runner_idle() {
        let (monitor, edges) = monitor_with_edges(3);
        monitor.status_for(0, SlotStatus::Idle).unwrap();
        monitor.status_for(1, SlotStatus::Busy).unwrap();
        monitor.status_for(2, SlotStatus::Busy).unwrap();
        assert_eq!(monitor.aggregate(), AggregateStatus::Idle);
        assert_eq!(edges.seen.lock().unwrap().len(), 1);

        monitor.status_for(0, SlotStatus::Busy).unwrap();
        assert_eq!(monitor.aggregate(), AggregateStatus::Busy);
        assert_eq!(edges.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn unknown_slots_do_not_count_as_idle() {
        let (monitor, edges) = monitor_with_edges(2);
        monitor.status_for(0, SlotStatus::Busy).unwrap();
        assert_eq!(monitor.aggregate(), AggregateStatus::Busy);
        assert!(edges.seen.lock().unwrap().is_empty());
        // Slot 1 is still unknown, so the pool can take work once it reports.
        assert_eq!(monitor.pool_status(), PoolStatus::Accepting);
    }

    #[test]
    fn full_iff_all_slots_busy() {
        let monitor = StatusMonitor::new(2);
        let mut pool_rx = monitor.watch_pool();
        monitor.status_for(0, SlotStatus::Busy).unwrap();
        assert_eq!(monitor.pool_status(), PoolStatus::Accepting);
        monitor.status_for(1, SlotStatus::Busy).unwrap();
        assert_eq!(monitor.pool_status(), PoolStatus::Full);
        assert!(pool_rx.has_changed().unwrap());
        assert_eq!(*pool_rx.borrow_and_update(), PoolStatus::Full);

        monitor.status_for(1, SlotStatus::Idle).unwrap();
        assert_eq!(monitor.pool_status(), PoolStatus::Accepting);
        assert_eq!(monitor.idle_slots(), vec![1]);
        assert_eq!(monitor.count(SlotStatus::Busy), 1);
    }

    #[test]
    fn aggregate_watch_follows_edges() {
        let monitor = StatusMonitor::new(1);
        let mut rx = monitor.watch_aggregate();
        monitor.status_for(0, SlotStatus::Idle).unwrap();
        assert_eq!(*rx.borrow_and_update(), AggregateStatus::Idle);
        monitor.status_for(0, SlotStatus::Idle).unwrap();
        assert!(!rx.has_changed().unwrap());
    }
}
