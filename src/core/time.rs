use std::sync::Arc;

/// Monotonic wall-clock source, swappable so tests can shift a node's clock.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> i64;
}

/// Current wall time in epoch milliseconds.
pub fn current_time_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        current_time_millis()
    }
}

/// A clock running a fixed offset from another one. Used to reproduce
/// wall-clock drift between nodes in tests.
#[derive(Debug)]
pub struct OffsetClock {
    inner: Arc<dyn Clock>,
    offset_millis: i64,
}

impl OffsetClock {
    pub fn new(inner: Arc<dyn Clock>, offset_millis: i64) -> Self {
        Self {
            inner,
            offset_millis,
        }
    }
}

impl Clock for OffsetClock {
    fn now_millis(&self) -> i64 {
        self.inner.now_millis() + self.offset_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_clock_shifts_time() {
        let base = Arc::new(SystemClock);
        let shifted = OffsetClock::new(base.clone(), 10_000);
        let delta = shifted.now_millis() - base.now_millis();
        assert!((9_900..=10_100).contains(&delta));
    }
}
