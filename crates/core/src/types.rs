use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModuleError;

/// Notification level. Variant order defines severity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Alert,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Alert => "alert",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "alert" => Ok(Severity::Alert),
            other => Err(ModuleError::ConfigurationInvalid(format!(
                "unknown severity '{other}'"
            ))),
        }
    }
}

/// A message travelling on the bus between modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    pub recipient: String,
    pub command: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        command: impl Into<String>,
        args: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            command: command.into(),
            args: args.into(),
            payload,
        }
    }

    /// Answer this message: same command and args, sender and recipient swapped.
    pub fn reply(&self, payload: serde_json::Value) -> Self {
        Self {
            sender: self.recipient.clone(),
            recipient: self.sender.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            payload,
        }
    }

    /// Look up a top-level key of an object payload.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    /// True when the payload carries nothing (deleted configuration, empty body).
    pub fn is_null(&self) -> bool {
        match &self.payload {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Payload rendered as text: strings verbatim, anything else as JSON.
    pub fn text(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}
