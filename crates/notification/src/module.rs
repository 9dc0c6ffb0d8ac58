//! Notification module: routes bus messages through the gate and dispatcher.

use std::sync::Arc;

use hub_core::config::NotificationConfig;
use hub_core::{Message, ModuleError, ModuleResult, Severity};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::dispatcher::{Deliverer, DispatcherStats, NotificationDispatcher, SubmitOutcome};
use crate::gate::{AdmitDecision, Clock, FilterConfig, LocalClock, NotificationGate};

pub const ALERTER: &str = "controller/alerter";
pub const CONFIG_SENDER: &str = "controller/config";

/// Runtime configuration pushed to the module over the bus.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub disabled: bool,
}

pub struct NotificationModule {
    fullname: String,
    settings: RwLock<Option<NotificationSettings>>,
    gate: NotificationGate,
    dispatcher: NotificationDispatcher,
}

impl std::fmt::Debug for NotificationModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationModule")
            .field("fullname", &self.fullname)
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl NotificationModule {
    pub fn new(
        fullname: impl Into<String>,
        deliverer: Arc<dyn Deliverer>,
        config: &NotificationConfig,
    ) -> Self {
        Self::with_clock(fullname, deliverer, config, Arc::new(LocalClock))
    }

    pub fn with_clock(
        fullname: impl Into<String>,
        deliverer: Arc<dyn Deliverer>,
        config: &NotificationConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fullname: fullname.into(),
            settings: RwLock::new(None),
            gate: NotificationGate::new(clock),
            dispatcher: NotificationDispatcher::new(deliverer, config),
        }
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn is_configured(&self) -> bool {
        self.settings.read().is_some()
    }

    /// Replace the module configuration. Invalid configuration keeps the previous one.
    pub fn configure(&self, payload: &serde_json::Value) -> ModuleResult<()> {
        let settings: NotificationSettings = serde_json::from_value(payload.clone())
            .map_err(|e| ModuleError::ConfigurationInvalid(e.to_string()))?;
        info!(
            module = %self.fullname,
            disabled = settings.disabled,
            filtered = settings.filter.is_some(),
            "configuration applied"
        );
        *self.settings.write() = Some(settings);
        Ok(())
    }

    pub fn on_message(&self, message: &Message) {
        if message.command == "CONF" && message.args == self.fullname {
            if let Err(e) = self.configure(&message.payload) {
                warn!(module = %self.fullname, error = %e, "ignoring configuration");
            }
            return;
        }

        let Some(settings) = self.settings.read().clone() else {
            debug!(module = %self.fullname, command = %message.command, "not configured yet, dropping message");
            return;
        };
        if settings.disabled {
            return;
        }

        let run_now = message.command == "RUN";
        let from_alerter = message.sender == ALERTER && message.command == "NOTIFY";
        if !run_now && !from_alerter {
            return;
        }

        let severity: Severity = match message.args.parse() {
            Ok(severity) => severity,
            Err(e) => {
                warn!(error = %e, sender = %message.sender, "dropping notification");
                return;
            }
        };
        let text = message.text();

        if from_alerter {
            if let Some(filter) = &settings.filter {
                if let AdmitDecision::Suppress(reason) = self.gate.admit(severity, &text, filter) {
                    metrics::counter!("notifications.suppressed", "reason" => reason.as_str())
                        .increment(1);
                    return;
                }
            }
            metrics::counter!("notifications.passed").increment(1);
        }

        self.notify(severity, &text);
    }

    fn notify(&self, severity: Severity, text: &str) -> Option<SubmitOutcome> {
        match self.dispatcher.submit(severity, text) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(module = %self.fullname, error = %e, "notification not accepted");
                None
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }
}
