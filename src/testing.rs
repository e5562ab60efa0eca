//! Test doubles shared by the unit tests and the integration suite.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::clock::Clock;
use crate::transport::{
    EmailTransport, InboundBounce, InboundEmail, OutboundEmail, TransportError,
};

/// Clock advanced by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Midnight 2026-03-01, an arbitrary fixed origin.
    pub fn at_origin() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poison| poison.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poison| poison.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// One scripted response for [`MockTransport::send`].
pub enum MockSend {
    Ok(String),
    Transient(String),
    Permanent(String),
    Panic(String),
}

/// Records every outbound email and replays scripted outcomes. With an
/// empty script every send succeeds with a fresh message id.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<OutboundEmail>>,
    script: Mutex<VecDeque<MockSend>>,
    counter: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: MockSend) {
        self.script
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push_back(response);
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }
}

impl EmailTransport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .pop_front();
        match scripted {
            Some(MockSend::Ok(message_id)) => {
                self.sent
                    .lock()
                    .unwrap_or_else(|poison| poison.into_inner())
                    .push(email.clone());
                Ok(message_id)
            }
            Some(MockSend::Transient(reason)) => Err(TransportError::Transient(reason)),
            Some(MockSend::Permanent(reason)) => Err(TransportError::Permanent(reason)),
            Some(MockSend::Panic(reason)) => panic!("{}", reason),
            None => {
                self.sent
                    .lock()
                    .unwrap_or_else(|poison| poison.into_inner())
                    .push(email.clone());
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                Ok(format!("<mock-{n}@transport.test>"))
            }
        }
    }

    fn parse_inbound(&self, body: &[u8]) -> Result<InboundEmail, TransportError> {
        serde_json::from_slice(body)
            .map_err(|err| TransportError::Permanent(format!("bad inbound payload: {err}")))
    }

    fn parse_bounce(&self, body: &[u8]) -> Result<InboundBounce, TransportError> {
        serde_json::from_slice(body)
            .map_err(|err| TransportError::Permanent(format!("bad bounce payload: {err}")))
    }
}
