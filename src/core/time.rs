//! Layer 0: Time primitives
//!
//! Hybrid Logical Clock for causal ordering. Every command and event gets
//! a `HybridTimestamp`; successive ticks are strictly increasing even when
//! the wall clock stalls or jumps backward.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// HLC timestamp - the ordering primitive.
///
/// (wall_ms, logical) forms a total order. !Copy intentional - forces
/// explicit .clone() to think about causality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    pub wall_ms: u64,
    pub logical: u32,
}

impl HybridTimestamp {
    /// Wire form: 8-byte big-endian wall_ms, 4-byte big-endian logical.
    pub const WIRE_LEN: usize = 12;

    pub fn new(wall_ms: u64, logical: u32) -> Self {
        Self { wall_ms, logical }
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.wall_ms);
        buf.put_u32(self.logical);
    }

    /// Caller must guarantee at least [`Self::WIRE_LEN`] remaining bytes.
    pub fn read_from(buf: &mut impl Buf) -> Self {
        let wall_ms = buf.get_u64();
        let logical = buf.get_u32();
        Self { wall_ms, logical }
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wall_ms
            .cmp(&other.wall_ms)
            .then_with(|| self.logical.cmp(&other.logical))
    }
}

impl std::fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.wall_ms, self.logical)
    }
}

/// Physical time source feeding the HLC.
///
/// Returns `None` when the source cannot currently provide time (e.g. an
/// NTP-backed source that lost its peers). The clock keeps advancing on
/// the logical component and counts degraded ticks.
pub trait PhysicalTimeSource: Send + Sync {
    fn now_ms(&self) -> Option<u64>;
}

/// Default source: system wall clock in milliseconds since the Unix epoch.
pub struct SystemTimeSource;

impl PhysicalTimeSource for SystemTimeSource {
    fn now_ms(&self) -> Option<u64> {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as u64)
    }
}

/// Manually driven source for deterministic tests.
#[cfg(any(test, feature = "test-harness"))]
pub struct ManualTimeSource {
    now_ms: AtomicU64,
    available: std::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "test-harness"))]
impl ManualTimeSource {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
            available: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, AtomicOrdering::Release);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, AtomicOrdering::AcqRel);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::Release);
    }
}

#[cfg(any(test, feature = "test-harness"))]
impl PhysicalTimeSource for ManualTimeSource {
    fn now_ms(&self) -> Option<u64> {
        if self.available.load(AtomicOrdering::Acquire) {
            Some(self.now_ms.load(AtomicOrdering::Acquire))
        } else {
            None
        }
    }
}

/// Hybrid Logical Clock.
///
/// One writer at a time (single mutex); readers snapshot via [`Self::peek`].
pub struct HybridClock {
    source: Arc<dyn PhysicalTimeSource>,
    state: Mutex<HybridTimestamp>,
    degraded_ticks: AtomicU64,
}

impl HybridClock {
    pub fn new(source: Arc<dyn PhysicalTimeSource>) -> Self {
        let wall_ms = source.now_ms().unwrap_or(0);
        Self {
            source,
            state: Mutex::new(HybridTimestamp::new(wall_ms, 0)),
            degraded_ticks: AtomicU64::new(0),
        }
    }

    /// Advance the clock and return a stamp strictly greater than any
    /// previously returned stamp.
    pub fn tick(&self) -> HybridTimestamp {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match self.source.now_ms() {
            Some(now) if now > state.wall_ms => {
                state.wall_ms = now;
                state.logical = 0;
            }
            Some(_) => {
                // Same millisecond or wall clock went backward.
                state.logical += 1;
            }
            None => {
                self.degraded_ticks.fetch_add(1, AtomicOrdering::AcqRel);
                state.logical += 1;
            }
        }
        state.clone()
    }

    /// Reconcile with a stamp observed elsewhere (journal recovery,
    /// federation). The next tick is guaranteed to exceed both clocks.
    pub fn update(&self, peer: &HybridTimestamp) -> HybridTimestamp {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = match self.source.now_ms() {
            Some(now) => now,
            None => {
                self.degraded_ticks.fetch_add(1, AtomicOrdering::AcqRel);
                0
            }
        };
        let max_pt = state.wall_ms.max(peer.wall_ms).max(now);
        let logical = if max_pt == state.wall_ms && max_pt == peer.wall_ms {
            state.logical.max(peer.logical) + 1
        } else if max_pt == state.wall_ms {
            state.logical + 1
        } else if max_pt == peer.wall_ms {
            peer.logical + 1
        } else {
            0
        };
        state.wall_ms = max_pt;
        state.logical = logical;
        state.clone()
    }

    /// Current stamp without advancing the clock.
    pub fn peek(&self) -> HybridTimestamp {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Monotone count of ticks taken while the physical source was
    /// unavailable. Readable by observability.
    pub fn degraded_ticks(&self) -> u64 {
        self.degraded_ticks.load(AtomicOrdering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_order_lexicographically() {
        let a = HybridTimestamp::new(1, 5);
        let b = HybridTimestamp::new(2, 0);
        let c = HybridTimestamp::new(2, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn tick_is_strictly_increasing() {
        let source = Arc::new(ManualTimeSource::new(100));
        let clock = HybridClock::new(source.clone());

        let mut prev = clock.tick();
        for i in 0..1000 {
            // Mix advancing, frozen, and regressing wall time.
            match i % 3 {
                0 => source.advance(1),
                1 => {}
                _ => source.set(50),
            }
            let next = clock.tick();
            assert!(next > prev, "tick {next} not after {prev}");
            prev = next;
        }
    }

    #[test]
    fn frozen_wall_clock_increments_logical() {
        let source = Arc::new(ManualTimeSource::new(7));
        let clock = HybridClock::new(source);
        let a = clock.tick();
        let b = clock.tick();
        assert_eq!(a.wall_ms, b.wall_ms);
        assert_eq!(b.logical, a.logical + 1);
    }

    #[test]
    fn advancing_wall_clock_resets_logical() {
        let source = Arc::new(ManualTimeSource::new(7));
        let clock = HybridClock::new(source.clone());
        clock.tick();
        clock.tick();
        source.advance(10);
        let stamp = clock.tick();
        assert_eq!(stamp.wall_ms, 17);
        assert_eq!(stamp.logical, 0);
    }

    #[test]
    fn update_folds_peer_ahead() {
        let source = Arc::new(ManualTimeSource::new(100));
        let clock = HybridClock::new(source);
        let stamp = clock.update(&HybridTimestamp::new(500, 3));
        assert_eq!(stamp.wall_ms, 500);
        assert_eq!(stamp.logical, 4);
        assert!(clock.tick() > stamp);
    }

    #[test]
    fn update_with_equal_wall_takes_max_logical() {
        let source = Arc::new(ManualTimeSource::new(100));
        let clock = HybridClock::new(source);
        clock.tick(); // (100, 0)
        let stamp = clock.update(&HybridTimestamp::new(100, 9));
        assert_eq!(stamp.wall_ms, 100);
        assert_eq!(stamp.logical, 10);
    }

    #[test]
    fn update_with_local_ahead_increments_local() {
        let source = Arc::new(ManualTimeSource::new(100));
        let clock = HybridClock::new(source.clone());
        clock.tick();
        source.set(40);
        let stamp = clock.update(&HybridTimestamp::new(50, 2));
        assert_eq!(stamp.wall_ms, 100);
        assert_eq!(stamp.logical, 1);
    }

    #[test]
    fn unavailable_source_degrades_but_advances() {
        let source = Arc::new(ManualTimeSource::new(100));
        let clock = HybridClock::new(source.clone());
        let a = clock.tick();
        source.set_available(false);
        let b = clock.tick();
        let c = clock.tick();
        assert!(b > a && c > b);
        assert_eq!(clock.degraded_ticks(), 2);
    }

    #[test]
    fn wire_roundtrip() {
        let stamp = HybridTimestamp::new(0x0102_0304_0506_0708, 0x0a0b_0c0d);
        let mut buf = Vec::new();
        stamp.write_to(&mut buf);
        assert_eq!(buf.len(), HybridTimestamp::WIRE_LEN);
        let decoded = HybridTimestamp::read_from(&mut buf.as_slice());
        assert_eq!(decoded, stamp);
    }
}
