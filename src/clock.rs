use chrono::{DateTime, Utc};

/// Wall-clock source. Injected everywhere time is read so tests can drive
/// the dispatcher deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
