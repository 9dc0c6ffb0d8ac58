//! Notification gate: minimum severity, mute windows, and hourly rate limiting.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Local, Timelike};
use hub_core::{ModuleError, Severity};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// Source of the current wall-clock hour.
pub trait Clock: Send + Sync {
    fn hour(&self) -> u32;
}

/// Local wall clock of the host.
pub struct LocalClock;

impl Clock for LocalClock {
    fn hour(&self) -> u32 {
        Local::now().hour()
    }
}

/// Clock pinned to a settable hour, for tests and replay.
pub struct ManualClock {
    hour: AtomicU32,
}

impl ManualClock {
    pub fn new(hour: u32) -> Self {
        Self {
            hour: AtomicU32::new(hour),
        }
    }

    pub fn set_hour(&self, hour: u32) {
        self.hour.store(hour, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn hour(&self) -> u32 {
        self.hour.load(Ordering::Relaxed)
    }
}

/// Hour range during which notifications are muted, e.g. `20-07`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MuteWindow {
    pub start: u32,
    pub end: u32,
}

impl MuteWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start < self.end {
            // e.g. 08-12
            hour >= self.start && hour < self.end
        } else if self.start > self.end {
            // e.g. 20-07, wraps midnight
            hour >= self.start || hour < self.end
        } else {
            false
        }
    }
}

impl fmt::Display for MuteWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.start, self.end)
    }
}

impl FromStr for MuteWindow {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').map(str::trim).collect();
        let invalid = || ModuleError::ConfigurationInvalid(format!("invalid mute window '{s}'"));
        if parts.len() != 2 {
            return Err(invalid());
        }
        let start: u32 = parts[0].parse().map_err(|_| invalid())?;
        let end: u32 = parts[1].parse().map_err(|_| invalid())?;
        if start > 23 || end > 24 {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

fn deserialize_mute<'de, D>(deserializer: D) -> Result<Option<MuteWindow>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Per-module filter, read from the `filter` section of the module configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub min_severity: Option<Severity>,
    #[serde(default)]
    pub mute_min_severity: Option<Severity>,
    #[serde(default, rename = "mute", deserialize_with = "deserialize_mute")]
    pub mute_window: Option<MuteWindow>,
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

impl FilterConfig {
    fn below_min_severity(&self, severity: Severity) -> bool {
        match self.min_severity {
            Some(Severity::Warning) => severity == Severity::Info,
            Some(Severity::Alert) => severity < Severity::Alert,
            _ => false,
        }
    }

    fn overrides_mute(&self, severity: Severity) -> bool {
        match self.mute_min_severity {
            Some(Severity::Warning) => severity >= Severity::Warning,
            Some(Severity::Alert) => severity == Severity::Alert,
            _ => false,
        }
    }
}

/// Hourly notification counter, reset lazily when the hour changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateState {
    pub current_hour: Option<u32>,
    pub counter: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    BelowMinSeverity,
    Muted,
    RateLimited,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::BelowMinSeverity => "below_min_severity",
            SuppressReason::Muted => "muted",
            SuppressReason::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Pass,
    Suppress(SuppressReason),
}

impl AdmitDecision {
    pub fn is_pass(&self) -> bool {
        matches!(self, AdmitDecision::Pass)
    }
}

/// Apply `filter` to one notification at `hour`, advancing `state` on pass.
pub fn evaluate(
    severity: Severity,
    hour: u32,
    filter: &FilterConfig,
    state: &mut RateState,
) -> AdmitDecision {
    if state.current_hour != Some(hour) {
        state.counter = 0;
        state.current_hour = Some(hour);
    }

    if filter.below_min_severity(severity) {
        return AdmitDecision::Suppress(SuppressReason::BelowMinSeverity);
    }

    if let Some(window) = filter.mute_window {
        if !filter.overrides_mute(severity) && window.contains(hour) {
            return AdmitDecision::Suppress(SuppressReason::Muted);
        }
    }

    if let Some(limit) = filter.rate_limit {
        if limit != 0 && state.counter >= limit {
            return AdmitDecision::Suppress(SuppressReason::RateLimited);
        }
    }

    state.counter += 1;
    AdmitDecision::Pass
}

/// Stateful gate owned by one notification module.
pub struct NotificationGate {
    clock: Arc<dyn Clock>,
    state: Mutex<RateState>,
}

impl NotificationGate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(RateState::default()),
        }
    }

    pub fn admit(&self, severity: Severity, text: &str, filter: &FilterConfig) -> AdmitDecision {
        let hour = self.clock.hour();
        let mut state = self.state.lock();
        let decision = evaluate(severity, hour, filter, &mut state);
        match decision {
            AdmitDecision::Pass if filter.rate_limit.is_some() => {
                debug!(
                    counter = state.counter,
                    hour = state.current_hour.unwrap_or(hour),
                    "notification #{} for hour {}:00",
                    state.counter,
                    hour
                );
            }
            AdmitDecision::Pass => {}
            AdmitDecision::Suppress(reason) => {
                debug!(%severity, text, reason = reason.as_str(), "notification suppressed");
            }
        }
        decision
    }

    pub fn rate_state(&self) -> RateState {
        self.state.lock().clone()
    }
}

impl Default for NotificationGate {
    fn default() -> Self {
        Self::new(Arc::new(LocalClock))
    }
}
