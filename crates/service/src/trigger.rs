//! Job triggers: when a scheduled poll fires.
//!
//! Sensors describe their schedule as a flat object tagged by `trigger`:
//!
//! ```json
//! {"trigger": "interval", "minutes": 5}
//! {"trigger": "date", "run_date": "2026-01-01T10:00:00+01:00"}
//! {"trigger": "cron", "hour": "*", "minute": "*/15"}
//! ```

use chrono::{DateTime, Duration, Local, Timelike};
use hub_core::{ModuleError, ModuleResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "lowercase")]
pub enum Trigger {
    Interval(IntervalTrigger),
    Date(DateTrigger),
    Cron(CronTrigger),
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Interval(_) => "interval",
            Trigger::Date(_) => "date",
            Trigger::Cron(_) => "cron",
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Trigger::Date(_))
    }

    pub fn validate(&self) -> ModuleResult<()> {
        match self {
            Trigger::Interval(interval) if interval.period_secs() == 0 => Err(
                ModuleError::ConfigurationInvalid("interval trigger needs a positive period".into()),
            ),
            Trigger::Interval(interval) => interval
                .period()
                .and_then(|period| Local::now().checked_add_signed(period))
                .map(|_| ())
                .ok_or_else(|| {
                    ModuleError::Scheduling(format!(
                        "interval of {}s is out of range",
                        interval.period_secs()
                    ))
                }),
            Trigger::Cron(cron) => cron.validate(),
            Trigger::Date(_) => Ok(()),
        }
    }

    /// Next fire time. `previous` is the last scheduled fire time, `None` before the first one.
    pub fn next_fire(
        &self,
        previous: Option<DateTime<Local>>,
        now: DateTime<Local>,
    ) -> Option<DateTime<Local>> {
        match self {
            Trigger::Interval(interval) => {
                previous.unwrap_or(now).checked_add_signed(interval.period()?)
            }
            Trigger::Date(date) => previous.is_none().then_some(date.run_date),
            Trigger::Cron(cron) => cron.next_after(previous.unwrap_or(now)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalTrigger {
    #[serde(default)]
    pub weeks: u64,
    #[serde(default)]
    pub days: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub seconds: u64,
}

impl IntervalTrigger {
    pub fn period_secs(&self) -> u64 {
        [
            (self.weeks, 604_800),
            (self.days, 86_400),
            (self.hours, 3_600),
            (self.minutes, 60),
            (self.seconds, 1),
        ]
        .iter()
        .fold(0u64, |total, (count, unit)| total.saturating_add(count.saturating_mul(*unit)))
    }

    /// The period as a signed duration, `None` when it does not fit.
    pub fn period(&self) -> Option<Duration> {
        Duration::try_seconds(i64::try_from(self.period_secs()).ok()?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateTrigger {
    pub run_date: DateTime<Local>,
}

/// One field of a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CronValue", into = "String")]
pub enum CronField {
    Any,
    Every(u32),
    Values(Vec<u32>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CronValue {
    Number(u32),
    Text(String),
}

impl TryFrom<CronValue> for CronField {
    type Error = String;

    fn try_from(value: CronValue) -> Result<Self, Self::Error> {
        let text = match value {
            CronValue::Number(n) => return Ok(CronField::Values(vec![n])),
            CronValue::Text(text) => text,
        };
        let text = text.trim();
        if text == "*" {
            return Ok(CronField::Any);
        }
        if let Some(step) = text.strip_prefix("*/") {
            return match step.parse::<u32>() {
                Ok(n) if n > 0 => Ok(CronField::Every(n)),
                _ => Err(format!("invalid cron step '{text}'")),
            };
        }
        let mut values = text
            .split(',')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| format!("invalid cron field '{text}'"))?;
        values.sort_unstable();
        values.dedup();
        Ok(CronField::Values(values))
    }
}

impl From<CronField> for String {
    fn from(field: CronField) -> Self {
        match field {
            CronField::Any => "*".to_string(),
            CronField::Every(n) => format!("*/{n}"),
            CronField::Values(values) => values
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Every(n) => value % n == 0,
            CronField::Values(values) => values.contains(&value),
        }
    }

    fn check_range(&self, name: &str, max: u32) -> ModuleResult<()> {
        if let CronField::Values(values) = self {
            if values.is_empty() || values.iter().any(|v| *v > max) {
                return Err(ModuleError::ConfigurationInvalid(format!(
                    "cron field '{name}' out of range 0-{max}"
                )));
            }
        }
        Ok(())
    }
}

/// Wall-clock trigger on hour/minute/second fields.
///
/// Unset fields below the most significant set field default to `0`,
/// unset fields above it default to `*`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CronTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<CronField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<CronField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<CronField>,
}

impl CronTrigger {
    fn resolved(&self) -> (CronField, CronField, CronField) {
        let zero = || CronField::Values(vec![0]);
        let hour = self.hour.clone().unwrap_or(CronField::Any);
        let minute = self.minute.clone().unwrap_or_else(|| {
            if self.hour.is_some() {
                zero()
            } else {
                CronField::Any
            }
        });
        let second = self.second.clone().unwrap_or_else(zero);
        (hour, minute, second)
    }

    fn validate(&self) -> ModuleResult<()> {
        let (hour, minute, second) = self.resolved();
        hour.check_range("hour", 23)?;
        minute.check_range("minute", 59)?;
        second.check_range("second", 59)
    }

    /// First matching instant strictly after `after`, searched over the next two days.
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let (hour, minute, second) = self.resolved();
        let start = after.with_nanosecond(0)?.with_second(0)?;
        for offset in 0..(48 * 60) {
            let candidate_minute = start + Duration::minutes(offset);
            if !hour.matches(candidate_minute.hour()) || !minute.matches(candidate_minute.minute()) {
                continue;
            }
            let found = (0..60)
                .filter(|s| second.matches(*s))
                .map(|s| candidate_minute + Duration::seconds(i64::from(s)))
                .find(|t| *t > after);
            if found.is_some() {
                return found;
            }
        }
        None
    }
}
