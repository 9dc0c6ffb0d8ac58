//! Outbound message bus: trait for publishing messages from any module.
//!
//! Modules accept an `Arc<dyn MessageSink>` to publish replies and sensor
//! readings. The host binary writes them to stdout; tests capture them.

use crate::types::Message;
use parking_lot::Mutex;
use std::sync::Arc;

pub trait MessageSink: Send + Sync {
    fn send(&self, message: Message);
}

/// In-memory sink that keeps every published message.
#[derive(Default)]
pub struct CaptureSink {
    messages: Mutex<Vec<Message>>,
}

impl CaptureSink {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

impl MessageSink for CaptureSink {
    fn send(&self, message: Message) {
        self.messages.lock().push(message);
    }
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::default())
}
