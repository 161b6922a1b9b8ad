//! Shared test doubles.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use mockable::Clock;

use crate::engine::{Engine, SharedClock};
use crate::notify::{DeliveryError, Dispatcher, Message, MessageSink};

/// A clock that stays put until told to move.
pub struct TestClock(Mutex<DateTime<Utc>>);

impl TestClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(now)))
    }

    /// 2024-03-10 12:00 UTC.
    pub fn fixture() -> Arc<Self> {
        Self::at(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap())
    }

    pub fn advance(&self, delta: TimeDelta) {
        *self.0.lock().unwrap() += delta;
    }
}

impl Clock for TestClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Sink that keeps every message it is handed.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<Message>>,
}

impl RecordingSink {
    pub fn taken(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }

    pub fn to(&self, recipient: i64) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.recipient == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn deliver(&self, message: Message) -> Result<(), DeliveryError> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

/// Sink that refuses everything.
pub struct FailingSink;

#[async_trait]
impl MessageSink for FailingSink {
    async fn deliver(&self, message: Message) -> Result<(), DeliveryError> {
        Err(DeliveryError::Unreachable(message.recipient))
    }
}

pub fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("lessond_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

pub fn engine_with(path: PathBuf, sink: Arc<dyn MessageSink>, clock: SharedClock) -> Engine {
    Engine::new(path, Dispatcher::new(sink), clock).unwrap()
}
