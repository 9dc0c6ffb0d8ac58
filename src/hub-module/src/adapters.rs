//! Concrete capabilities wired by the host: a log-backed notifier, an echo
//! service, and a stdout message sink.

use std::io::Write;

use chrono::Local;
use hub_core::{Message, MessageSink, Severity};
use hub_notification::Deliverer;
use hub_service::{ServiceHandler, ServiceModule};
use serde_json::json;
use tracing::{info, warn};

/// Delivers notifications to the structured log.
pub struct LogDeliverer;

impl Deliverer for LogDeliverer {
    fn deliver(&self, severity: Severity, text: &str) -> anyhow::Result<()> {
        info!(%severity, text, "notification delivered");
        Ok(())
    }
}

/// Answers every poll with the sensor configuration and a timestamp.
pub struct EchoService;

impl ServiceHandler for EchoService {
    fn on_message(&self, service: &ServiceModule, message: &Message) -> anyhow::Result<()> {
        match message.command.as_str() {
            "IN" => {
                let Some(record) = service.registry().get(&message.args) else {
                    anyhow::bail!("sensor {} is not registered", message.args);
                };
                service.send(message.reply(json!({
                    "polled_at": Local::now().to_rfc3339(),
                    "mode": record.mode,
                    "configuration": message.payload,
                })));
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Writes outbound messages to stdout, one JSON document per line.
pub struct StdoutSink;

impl MessageSink for StdoutSink {
    fn send(&self, message: Message) {
        let line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "unable to serialize outbound message");
                return;
            }
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}") {
            warn!(error = %e, "unable to write outbound message");
        }
    }
}
