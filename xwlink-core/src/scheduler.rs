//! Persisted timer multiplexer: many clients, one underlying alarm.
//!
//! Each client owns a [`BackoffRecord`]. On every alarm tick the scheduler fires due
//! clients, grows the backoff of those with one, and re-arms a single alarm at the
//! earliest remaining fire time. The table is persisted after every mutation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::storage::{self, KvStore};

/// Never arm the alarm closer than this to "now".
pub const MIN_FUTURE_MS: u64 = 2_000;

/// Re-arm only if the new fire time moves by more than this.
pub const REARM_SLOP_MS: u64 = 1_000;

const STORE_KEY: &str = "scheduler.table";

/// Per-client timer state. `next_fire_ms == 0` means no timer pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffRecord {
    pub next_fire_ms: u64,
    pub backoff_ms: u64,
}

/// Exponential-ish retry interval: ×1.5 per miss, clamped to `[floor, ceiling]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub floor_ms: u64,
    pub ceiling_ms: u64,
}

impl BackoffPolicy {
    pub fn new(floor_ms: u64, ceiling_ms: u64) -> Self {
        Self {
            floor_ms,
            ceiling_ms: ceiling_ms.max(floor_ms),
        }
    }

    pub fn next(&self, prev_ms: u64) -> u64 {
        let next = if prev_ms < self.floor_ms {
            self.floor_ms
        } else {
            prev_ms.saturating_mul(3) / 2
        };
        next.min(self.ceiling_ms)
    }
}

impl Default for BackoffPolicy {
    /// 2 minutes to 4 hours.
    fn default() -> Self {
        Self::new(2 * 60 * 1000, 4 * 60 * 60 * 1000)
    }
}

/// A live handle the scheduler calls back into. Registered at startup under a stable key.
pub trait TimerClient: Send + Sync {
    fn timer_fired(&self);
    /// Next backoff after a fire with backoff `prev_ms`. Must not shrink.
    fn increment_backoff(&self, prev_ms: u64) -> u64;
}

/// The one underlying OS/runtime alarm.
pub trait AlarmSink: Send + Sync {
    fn arm(&self, at_ms: u64);
    fn cancel(&self);
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock, epoch milliseconds.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Table {
    records: BTreeMap<String, BackoffRecord>,
    /// Fire time the alarm is currently armed for; 0 if none.
    armed_ms: u64,
}

/// Process-wide timer/backoff scheduler, constructed once and shared by `Arc`.
pub struct Scheduler {
    table: Mutex<Table>,
    clients: Mutex<HashMap<String, Arc<dyn TimerClient>>>,
    store: Arc<dyn KvStore>,
    alarm: Arc<dyn AlarmSink>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    /// Load persisted state (or start empty) and re-arm for whatever is pending.
    pub fn load(store: Arc<dyn KvStore>, alarm: Arc<dyn AlarmSink>, clock: Arc<dyn Clock>) -> Self {
        let mut table: Table = storage::load_or_default(store.as_ref(), STORE_KEY);
        // Whatever was armed belonged to the previous process.
        table.armed_ms = 0;
        let sched = Self {
            table: Mutex::new(table),
            clients: Mutex::new(HashMap::new()),
            store,
            alarm,
            clock,
        };
        {
            let mut t = sched.lock_table();
            sched.rearm(&mut t);
            sched.persist(&t);
        }
        sched
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn TimerClient>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Map `key` to a live callback handle. Replaces any earlier registration.
    pub fn register_client(&self, key: &str, client: Arc<dyn TimerClient>) {
        self.lock_clients().insert(key.to_string(), client);
    }

    /// Forget `key` entirely so no stale callback fires into a torn-down instance.
    pub fn deregister_client(&self, key: &str) {
        self.lock_clients().remove(key);
        let mut t = self.lock_table();
        if t.records.remove(key).is_some() {
            self.rearm(&mut t);
            self.persist(&t);
        }
    }

    /// Set or replace the single pending fire time for `key`.
    pub fn set_timer(&self, key: &str, fire_at_ms: u64) {
        let mut t = self.lock_table();
        t.records.entry(key.to_string()).or_default().next_fire_ms = fire_at_ms;
        self.rearm(&mut t);
        self.persist(&t);
    }

    /// One-shot timer `wait_ms` from now.
    pub fn set_timer_relative(&self, key: &str, wait_ms: u64) {
        let at = self.now_ms().saturating_add(wait_ms);
        self.set_timer(key, at);
    }

    /// Seed the backoff for `key` and fire after it. The timer repeats, growing the
    /// backoff through the client, until the backoff is set to 0.
    pub fn set_backoff(&self, key: &str, backoff_ms: u64) -> u64 {
        let now = self.now_ms();
        let mut t = self.lock_table();
        let rec = t.records.entry(key.to_string()).or_default();
        rec.backoff_ms = backoff_ms;
        rec.next_fire_ms = if backoff_ms == 0 {
            0
        } else {
            now.saturating_add(backoff_ms)
        };
        tracing::debug!(client = key, backoff_ms, "backoff set");
        self.rearm(&mut t);
        self.persist(&t);
        backoff_ms
    }

    pub fn record(&self, key: &str) -> Option<BackoffRecord> {
        self.lock_table().records.get(key).copied()
    }

    /// Alarm tick: fire every due client, grow backoffs, re-arm.
    pub fn on_alarm(&self) {
        let now = self.now_ms();
        let due = self.take_due(now);
        if due.is_empty() {
            let mut t = self.lock_table();
            self.rearm(&mut t);
            return;
        }

        // Callbacks run with no lock held so a client may call straight back in.
        let mut grown = Vec::new();
        for (key, client, prev_backoff) in &due {
            tracing::debug!(client = %key, "timer fired");
            client.timer_fired();
            if *prev_backoff != 0 {
                let next = client.increment_backoff(*prev_backoff).max(*prev_backoff);
                grown.push((key.clone(), *prev_backoff, next));
            }
        }

        let now = self.now_ms();
        let mut t = self.lock_table();
        for (key, prev, next) in grown {
            if let Some(rec) = t.records.get_mut(&key) {
                // Skip if the client rescheduled itself from inside its callback.
                if rec.next_fire_ms == 0 && rec.backoff_ms == prev {
                    rec.backoff_ms = next;
                    rec.next_fire_ms = now.saturating_add(next);
                }
            }
        }
        self.rearm(&mut t);
        self.persist(&t);
    }

    /// Fire every registered client now, regardless of its fire time.
    pub fn fire_all(&self) {
        let now = self.now_ms();
        {
            let mut t = self.lock_table();
            for rec in t.records.values_mut() {
                rec.next_fire_ms = now;
            }
        }
        self.on_alarm();
    }

    /// Clear due records; drop those whose client can no longer be resolved.
    fn take_due(&self, now: u64) -> Vec<(String, Arc<dyn TimerClient>, u64)> {
        let clients = self.lock_clients().clone();
        let mut t = self.lock_table();
        t.armed_ms = 0;
        let due_keys: Vec<String> = t
            .records
            .iter()
            .filter(|(_, r)| r.next_fire_ms != 0 && r.next_fire_ms <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut due = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            match clients.get(&key) {
                Some(client) => {
                    if let Some(rec) = t.records.get_mut(&key) {
                        rec.next_fire_ms = 0;
                        due.push((key, client.clone(), rec.backoff_ms));
                    }
                }
                None => {
                    tracing::warn!(client = %key, "no such timer client; dropping record");
                    t.records.remove(&key);
                }
            }
        }
        self.persist(&t);
        due
    }

    fn rearm(&self, t: &mut Table) {
        let next = t
            .records
            .values()
            .map(|r| r.next_fire_ms)
            .filter(|&ms| ms != 0)
            .min();
        match next {
            None => {
                if t.armed_ms != 0 {
                    self.alarm.cancel();
                    t.armed_ms = 0;
                }
            }
            Some(at) => {
                let at = at.max(self.now_ms().saturating_add(MIN_FUTURE_MS));
                if t.armed_ms == 0 || t.armed_ms.abs_diff(at) > REARM_SLOP_MS {
                    tracing::debug!(at_ms = at, "arming alarm");
                    self.alarm.arm(at);
                    t.armed_ms = at;
                }
            }
        }
    }

    fn persist(&self, t: &Table) {
        if let Err(e) = storage::save(self.store.as_ref(), STORE_KEY, t) {
            tracing::warn!(error = %e, "failed to persist scheduler table");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn set(&self, ms: u64) {
            self.0.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingAlarm {
        armed: Mutex<Vec<u64>>,
        cancels: AtomicUsize,
    }

    impl AlarmSink for RecordingAlarm {
        fn arm(&self, at_ms: u64) {
            self.armed.lock().unwrap().push(at_ms);
        }
        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingClient {
        fired: AtomicUsize,
        policy: BackoffPolicy,
    }

    impl TimerClient for CountingClient {
        fn timer_fired(&self) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
        fn increment_backoff(&self, prev_ms: u64) -> u64 {
            self.policy.next(prev_ms)
        }
    }

    fn setup() -> (Arc<MemoryKvStore>, Arc<RecordingAlarm>, Arc<ManualClock>, Scheduler) {
        let store = Arc::new(MemoryKvStore::new());
        let alarm = Arc::new(RecordingAlarm::default());
        let clock = Arc::new(ManualClock::default());
        clock.set(1_000_000);
        let s = Scheduler::load(store.clone(), alarm.clone(), clock.clone());
        (store, alarm, clock, s)
    }

    fn client(floor: u64, ceiling: u64) -> Arc<CountingClient> {
        Arc::new(CountingClient {
            fired: AtomicUsize::new(0),
            policy: BackoffPolicy::new(floor, ceiling),
        })
    }

    #[test]
    fn policy_monotonic_and_bounded() {
        let p = BackoffPolicy::new(120_000, 4 * 3_600_000);
        let mut b = 0;
        let mut prev = 0;
        for _ in 0..64 {
            b = p.next(b);
            assert!(b >= prev);
            assert!(b >= p.floor_ms && b <= p.ceiling_ms);
            prev = b;
        }
        assert_eq!(b, p.ceiling_ms);
        assert_eq!(p.next(0), 120_000);
        assert_eq!(p.next(120_000), 180_000);
    }

    #[test]
    fn fires_due_client_and_clears() {
        let (_, alarm, clock, s) = setup();
        let c = client(1000, 10_000);
        s.register_client("a", c.clone());
        s.set_timer("a", 1_005_000);
        assert_eq!(alarm.armed.lock().unwrap().last(), Some(&1_005_000));
        clock.set(1_005_000);
        s.on_alarm();
        assert_eq!(c.fired.load(Ordering::SeqCst), 1);
        assert_eq!(s.record("a").unwrap().next_fire_ms, 0);
        // nothing pending: no new arm
        assert_eq!(alarm.armed.lock().unwrap().len(), 1);
    }

    #[test]
    fn clearing_last_timer_cancels_alarm() {
        let (_, alarm, _, s) = setup();
        s.register_client("a", client(1, 2));
        s.set_timer("a", 1_100_000);
        s.set_timer("a", 0);
        assert_eq!(alarm.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_repeats_and_grows() {
        let (_, _, clock, s) = setup();
        let c = client(10_000, 40_000);
        s.register_client("net", c.clone());
        s.set_backoff("net", 10_000);
        clock.set(1_010_000);
        s.on_alarm();
        let rec = s.record("net").unwrap();
        assert_eq!(rec.backoff_ms, 15_000);
        assert_eq!(rec.next_fire_ms, 1_025_000);
        clock.set(1_025_000);
        s.on_alarm();
        assert_eq!(s.record("net").unwrap().backoff_ms, 22_500);
        assert_eq!(c.fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn min_future_guard() {
        let (_, alarm, _, s) = setup();
        s.register_client("a", client(1, 2));
        s.set_timer("a", 1_000_100);
        assert_eq!(
            alarm.armed.lock().unwrap().last(),
            Some(&(1_000_000 + MIN_FUTURE_MS))
        );
    }

    #[test]
    fn small_moves_do_not_rearm() {
        let (_, alarm, _, s) = setup();
        s.register_client("a", client(1, 2));
        s.register_client("b", client(1, 2));
        s.set_timer("a", 1_100_000);
        s.set_timer("b", 1_100_500);
        assert_eq!(alarm.armed.lock().unwrap().len(), 1);
        s.set_timer("b", 1_050_000);
        assert_eq!(alarm.armed.lock().unwrap().len(), 2);
    }

    #[test]
    fn unresolvable_client_dropped() {
        let (_, _, clock, s) = setup();
        s.set_timer("ghost", 1_001_000);
        clock.set(1_002_000);
        s.on_alarm();
        assert!(s.record("ghost").is_none());
    }

    #[test]
    fn state_survives_restart() {
        let (store, _, clock, s) = setup();
        s.register_client("a", client(1000, 2000));
        s.set_backoff("a", 5_000);
        drop(s);
        let alarm = Arc::new(RecordingAlarm::default());
        let s2 = Scheduler::load(store, alarm.clone(), clock);
        assert_eq!(
            s2.record("a"),
            Some(BackoffRecord {
                next_fire_ms: 1_005_000,
                backoff_ms: 5_000
            })
        );
        assert_eq!(alarm.armed.lock().unwrap().last(), Some(&1_005_000));
    }

    #[test]
    fn client_rescheduling_itself_wins() {
        struct Resetter {
            sched: Mutex<Option<Arc<Scheduler>>>,
        }
        impl TimerClient for Resetter {
            fn timer_fired(&self) {
                if let Some(s) = self.sched.lock().unwrap().as_ref() {
                    s.set_backoff("r", 1_000);
                }
            }
            fn increment_backoff(&self, prev_ms: u64) -> u64 {
                prev_ms * 10
            }
        }
        let (_, _, clock, s) = setup();
        let s = Arc::new(s);
        let r = Arc::new(Resetter {
            sched: Mutex::new(Some(s.clone())),
        });
        s.register_client("r", r.clone());
        s.set_backoff("r", 4_000);
        clock.set(1_004_000);
        s.on_alarm();
        assert_eq!(s.record("r").unwrap().backoff_ms, 1_000);
        r.sched.lock().unwrap().take();
    }

    #[test]
    fn fire_all_fires_everyone() {
        let (_, _, _, s) = setup();
        let a = client(1, 2);
        let b = client(1, 2);
        s.register_client("a", a.clone());
        s.register_client("b", b.clone());
        s.set_timer("a", 9_000_000);
        s.set_timer("b", 9_500_000);
        s.fire_all();
        assert_eq!(a.fired.load(Ordering::SeqCst), 1);
        assert_eq!(b.fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregister_removes_record() {
        let (_, _, _, s) = setup();
        s.register_client("a", client(1, 2));
        s.set_timer("a", 1_100_000);
        s.deregister_client("a");
        assert!(s.record("a").is_none());
    }
}
