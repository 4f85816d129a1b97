use core::time::Duration;
use metrics::{counter, gauge, histogram};
use std::sync::atomic::{AtomicU64, Ordering};

struct Stat {
    count: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Stat {
    const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            max_ns: AtomicU64::new(0),
        }
    }

    fn observe(&self, bytes: usize, dur: Duration, ok: bool) {
        let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let avg_ns = if count == 0 {
            0.0
        } else {
            total_ns as f64 / count as f64
        };
        StatSnapshot {
            count,
            errors: self.errors.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            avg_ns,
            max_ns: self.max_ns.load(Ordering::Relaxed),
        }
    }
}

static CONNECT: Stat = Stat::new();
static HANDSHAKE: Stat = Stat::new();
static READ: Stat = Stat::new();
static WRITE: Stat = Stat::new();
static TEARDOWN: Stat = Stat::new();
static ATTACHED_UNITS: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, Default)]
pub struct StatSnapshot {
    pub count: u64,
    pub errors: u64,
    pub bytes: u64,
    pub avg_ns: f64,
    pub max_ns: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSnapshot {
    pub connect: StatSnapshot,
    pub handshake: StatSnapshot,
    pub read: StatSnapshot,
    pub write: StatSnapshot,
    pub teardown: StatSnapshot,
    pub attached_units: u64,
}

pub(crate) fn observe_connect(dur: Duration, ok: bool) {
    counter!("nbd_connect_count").increment(1);
    if !ok {
        counter!("nbd_connect_errors").increment(1);
    }
    CONNECT.observe(0, dur, ok);
}

pub(crate) fn observe_handshake(dur: Duration, ok: bool) {
    let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
    counter!("nbd_handshake_count").increment(1);
    if !ok {
        counter!("nbd_handshake_errors").increment(1);
    }
    histogram!("nbd_handshake_latency_ns").record(ns as f64);
    HANDSHAKE.observe(0, dur, ok);
}

pub(crate) fn observe_read(bytes: usize, dur: Duration, ok: bool) {
    let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
    counter!("nbd_read_count").increment(1);
    if ok {
        counter!("nbd_read_bytes").increment(bytes as u64);
    } else {
        counter!("nbd_read_errors").increment(1);
    }
    histogram!("nbd_read_latency_ns").record(ns as f64);
    READ.observe(if ok { bytes } else { 0 }, dur, ok);
}

pub(crate) fn observe_write(bytes: usize, dur: Duration, ok: bool) {
    counter!("nbd_write_count").increment(1);
    if !ok {
        counter!("nbd_write_errors").increment(1);
    }
    WRITE.observe(if ok { bytes } else { 0 }, dur, ok);
}

pub(crate) fn observe_teardown(dur: Duration) {
    counter!("nbd_teardown_count").increment(1);
    TEARDOWN.observe(0, dur, true);
}

pub(crate) fn unit_attached() {
    let now = ATTACHED_UNITS.fetch_add(1, Ordering::Relaxed) + 1;
    gauge!("nbd_attached_units").set(now as f64);
}

pub(crate) fn unit_detached() {
    let prev = ATTACHED_UNITS
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        })
        .unwrap_or(0);
    gauge!("nbd_attached_units").set(prev.saturating_sub(1) as f64);
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        connect: CONNECT.snapshot(),
        handshake: HANDSHAKE.snapshot(),
        read: READ.snapshot(),
        write: WRITE.snapshot(),
        teardown: TEARDOWN.snapshot(),
        attached_units: ATTACHED_UNITS.load(Ordering::Relaxed),
    }
}
