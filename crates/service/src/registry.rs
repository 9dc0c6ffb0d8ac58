//! Sensor registry: tracks which sensors belong to this service and keeps
//! one polling job per pull sensor.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Local};
use hub_core::config::ServiceConfig;
use hub_core::{is_valid_configuration, Message};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::scheduler::{JobHandle, JobSpec, PollTask, ScheduleProvider};
use crate::trigger::{DateTrigger, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorMode {
    /// Polled by this service on a schedule.
    Pull,
    /// Reports on its own; no schedule.
    Push,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    pub id: String,
    pub mode: SensorMode,
    pub configuration: serde_json::Value,
    pub schedule: Option<Trigger>,
    pub job_handle: Option<JobHandle>,
}

/// Sensor id addressed by a `sensors/<id>` configuration message.
pub fn sensor_id_of(message: &Message) -> String {
    message
        .args
        .strip_prefix("sensors/")
        .unwrap_or(&message.args)
        .to_string()
}

pub struct SensorRegistry {
    service_name: String,
    config: ServiceConfig,
    provider: Arc<dyn ScheduleProvider>,
    push_requirements: Vec<String>,
    sensors: Mutex<HashMap<String, SensorRecord>>,
}

impl SensorRegistry {
    pub fn new(config: ServiceConfig, provider: Arc<dyn ScheduleProvider>) -> Self {
        Self {
            service_name: config.name.clone(),
            config,
            provider,
            push_requirements: Vec::new(),
            sensors: Mutex::new(HashMap::new()),
        }
    }

    /// Keys every push sensor's `configuration` must carry.
    pub fn with_push_requirements(mut self, keys: Vec<String>) -> Self {
        self.push_requirements = keys;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Register (or re-register) the sensor described by a configuration message.
    ///
    /// Returns the sensor id when the sensor is now registered with this service.
    pub fn register(&self, message: &Message) -> Option<String> {
        let sensor_id = sensor_id_of(message);
        let sensor = &message.payload;

        let Some(service) = sensor.get("service") else {
            self.unregister_id(&sensor_id);
            return None;
        };
        if service.get("name").and_then(|n| n.as_str()) != Some(self.service_name.as_str()) {
            self.unregister_id(&sensor_id);
            return None;
        }
        if sensor.get("disabled").and_then(|d| d.as_bool()).unwrap_or(false) {
            self.unregister_id(&sensor_id);
            return None;
        }
        if !is_valid_configuration(&["configuration"], service) {
            return None;
        }
        let configuration = service["configuration"].clone();

        let record = match service.get("mode").and_then(|m| m.as_str()) {
            Some("pull") => {
                if !is_valid_configuration(&["schedule"], service) {
                    return None;
                }
                let trigger: Trigger = match serde_json::from_value(service["schedule"].clone()) {
                    Ok(trigger) => trigger,
                    Err(e) => {
                        error!(sensor_id = %sensor_id, error = %e, "invalid schedule");
                        return None;
                    }
                };
                info!(
                    sensor_id = %sensor_id,
                    schedule = %service["schedule"],
                    configuration = %configuration,
                    "registered pull sensor"
                );
                SensorRecord {
                    id: sensor_id.clone(),
                    mode: SensorMode::Pull,
                    configuration,
                    schedule: Some(trigger),
                    job_handle: None,
                }
            }
            Some("push") => {
                if !is_valid_configuration(&self.push_requirements, &configuration) {
                    return None;
                }
                info!(sensor_id = %sensor_id, configuration = %configuration, "registered push sensor");
                SensorRecord {
                    id: sensor_id.clone(),
                    mode: SensorMode::Push,
                    configuration,
                    schedule: None,
                    job_handle: None,
                }
            }
            other => {
                warn!(sensor_id = %sensor_id, mode = ?other, "unsupported sensor mode");
                return None;
            }
        };

        let mut sensors = self.sensors.lock();
        if let Some(previous) = sensors.remove(&sensor_id) {
            self.cancel(&sensor_id, previous.job_handle);
        }
        let mut record = record;
        if let Some(trigger) = &record.schedule {
            record.job_handle = self.schedule(&sensor_id, trigger, &record.configuration);
        }
        sensors.insert(sensor_id.clone(), record);
        metrics::counter!("sensors.registered").increment(1);
        Some(sensor_id)
    }

    /// Forget the sensor addressed by `message`, cancelling its job. Idempotent.
    pub fn unregister(&self, message: &Message) -> String {
        let sensor_id = sensor_id_of(message);
        self.unregister_id(&sensor_id);
        sensor_id
    }

    fn unregister_id(&self, sensor_id: &str) {
        let mut sensors = self.sensors.lock();
        if let Some(record) = sensors.remove(sensor_id) {
            self.cancel(sensor_id, record.job_handle);
            metrics::counter!("sensors.unregistered").increment(1);
            debug!(sensor_id, "unregistered sensor");
        }
    }

    fn schedule(
        &self,
        sensor_id: &str,
        trigger: &Trigger,
        configuration: &serde_json::Value,
    ) -> Option<JobHandle> {
        let task = PollTask {
            sensor_id: sensor_id.to_string(),
            configuration: configuration.clone(),
        };
        let job = JobSpec {
            trigger: trigger.clone(),
            jitter_secs: self.config.jitter_secs,
            task: task.clone(),
        };
        let handle = match self.provider.add(job) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(sensor_id, error = %e, "unable to schedule job for sensor");
                None
            }
        };

        if matches!(trigger, Trigger::Interval(_)) && self.config.poll_at_startup {
            let delay = self.startup_delay_secs();
            let Some(run_date) = i64::try_from(delay)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|d| Local::now().checked_add_signed(d))
            else {
                error!(sensor_id, delay, "startup poll delay out of range");
                return handle;
            };
            let poll_now = JobSpec {
                trigger: Trigger::Date(DateTrigger { run_date }),
                jitter_secs: 0,
                task,
            };
            match self.provider.add(poll_now) {
                Ok(_) => debug!(sensor_id, delay, "startup poll scheduled"),
                Err(e) => error!(sensor_id, error = %e, "unable to schedule startup poll"),
            }
        }
        handle
    }

    fn startup_delay_secs(&self) -> u64 {
        let min = self.config.startup_delay_min_secs;
        let max = self.config.startup_delay_max_secs.max(min);
        rand::thread_rng().gen_range(min..=max)
    }

    fn cancel(&self, sensor_id: &str, handle: Option<JobHandle>) {
        let Some(handle) = handle else {
            return;
        };
        if !self.provider.list().contains(&handle) {
            return;
        }
        if let Err(e) = self.provider.remove(&handle) {
            error!(sensor_id, job = %handle, error = %e, "unable to remove scheduled job for sensor");
        }
    }

    pub fn get(&self, sensor_id: &str) -> Option<SensorRecord> {
        self.sensors.lock().get(sensor_id).cloned()
    }

    pub fn job_handle(&self, sensor_id: &str) -> Option<JobHandle> {
        self.sensors.lock().get(sensor_id).and_then(|r| r.job_handle)
    }

    pub fn sensor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sensors.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sensors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MemoryScheduler;
    use serde_json::json;

    fn registry(poll_at_startup: bool) -> (SensorRegistry, Arc<MemoryScheduler>) {
        let scheduler = Arc::new(MemoryScheduler::new());
        let config = ServiceConfig {
            name: "weather".to_string(),
            poll_at_startup,
            ..Default::default()
        };
        (SensorRegistry::new(config, scheduler.clone()), scheduler)
    }

    fn sensor_conf(id: &str, payload: serde_json::Value) -> Message {
        Message::new(
            "controller/config",
            "service/weather",
            "CONF",
            format!("sensors/{id}"),
            payload,
        )
    }

    fn pull_sensor(schedule: serde_json::Value) -> serde_json::Value {
        json!({
            "description": "outdoor temperature",
            "service": {
                "name": "weather",
                "mode": "pull",
                "configuration": {"city": "Rome"},
                "schedule": schedule
            }
        })
    }

    #[test]
    fn test_pull_sensor_with_startup_poll() {
        let (registry, scheduler) = registry(true);
        let id = registry.register(&sensor_conf(
            "outdoor",
            pull_sensor(json!({"trigger": "interval", "minutes": 10})),
        ));
        assert_eq!(id.as_deref(), Some("outdoor"));

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].spec.trigger.kind(), "interval");
        assert_eq!(jobs[0].spec.jitter_secs, 15);
        assert_eq!(registry.job_handle("outdoor"), Some(jobs[0].handle));

        let Trigger::Date(date) = &jobs[1].spec.trigger else {
            panic!("startup poll should be a date job");
        };
        let delay = (date.run_date - Local::now()).num_seconds();
        assert!((4..=20).contains(&delay), "delay {delay} outside 5-20s");
        assert_eq!(jobs[1].spec.task, jobs[0].spec.task);
        assert_eq!(jobs[1].spec.task.configuration, json!({"city": "Rome"}));
    }

    #[test]
    fn test_reregistration_replaces_job() {
        let (registry, scheduler) = registry(false);
        let msg = sensor_conf("outdoor", pull_sensor(json!({"trigger": "interval", "minutes": 10})));
        registry.register(&msg);
        let first = registry.job_handle("outdoor").unwrap();

        registry.register(&msg);
        let second = registry.job_handle("outdoor").unwrap();

        assert_ne!(first, second);
        assert_eq!(scheduler.removed(), vec![first]);
        assert_eq!(scheduler.list(), vec![second]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cron_schedule_has_no_startup_poll() {
        let (registry, scheduler) = registry(true);
        registry.register(&sensor_conf(
            "rain",
            pull_sensor(json!({"trigger": "cron", "minute": "*/30"})),
        ));
        assert_eq!(scheduler.jobs().len(), 1);
    }

    #[test]
    fn test_push_sensor_is_not_scheduled() {
        let (registry, scheduler) = registry(true);
        let registry = registry.with_push_requirements(vec!["topic".to_string()]);
        let missing = sensor_conf(
            "door",
            json!({"service": {"name": "weather", "mode": "push", "configuration": {}}}),
        );
        assert_eq!(registry.register(&missing), None);

        let valid = sensor_conf(
            "door",
            json!({"service": {"name": "weather", "mode": "push", "configuration": {"topic": "door/1"}}}),
        );
        assert_eq!(registry.register(&valid).as_deref(), Some("door"));
        assert!(scheduler.jobs().is_empty());
        assert_eq!(registry.get("door").unwrap().mode, SensorMode::Push);
    }

    #[test]
    fn test_switch_from_pull_to_push_cancels_job() {
        let (registry, scheduler) = registry(false);
        registry.register(&sensor_conf(
            "lux",
            pull_sensor(json!({"trigger": "interval", "seconds": 30})),
        ));
        assert_eq!(scheduler.list().len(), 1);

        registry.register(&sensor_conf(
            "lux",
            json!({"service": {"name": "weather", "mode": "push", "configuration": {}}}),
        ));
        assert!(scheduler.list().is_empty());
        assert_eq!(registry.job_handle("lux"), None);
    }

    #[test]
    fn test_dissociated_sensor_is_unregistered() {
        let (registry, scheduler) = registry(false);
        let schedule = json!({"trigger": "interval", "minutes": 1});
        for id in ["a", "b", "c"] {
            registry.register(&sensor_conf(id, pull_sensor(schedule.clone())));
        }
        assert_eq!(registry.len(), 3);

        // moved to another service
        let mut other = pull_sensor(schedule.clone());
        other["service"]["name"] = json!("openweathermap");
        assert_eq!(registry.register(&sensor_conf("a", other)), None);
        // disabled
        let mut disabled = pull_sensor(schedule.clone());
        disabled["disabled"] = json!(true);
        assert_eq!(registry.register(&sensor_conf("b", disabled)), None);
        // no longer bound to any service
        assert_eq!(registry.register(&sensor_conf("c", json!({"description": "x"}))), None);

        assert!(registry.is_empty());
        assert!(scheduler.list().is_empty());
        assert_eq!(scheduler.removed().len(), 3);
    }

    #[test]
    fn test_invalid_registrations_abort() {
        let (registry, scheduler) = registry(true);
        let no_config = json!({"service": {"name": "weather", "mode": "pull", "schedule": {"trigger": "interval", "minutes": 1}}});
        assert_eq!(registry.register(&sensor_conf("a", no_config)), None);

        let no_schedule = json!({"service": {"name": "weather", "mode": "pull", "configuration": {}}});
        assert_eq!(registry.register(&sensor_conf("b", no_schedule)), None);

        assert_eq!(
            registry.register(&sensor_conf("c", pull_sensor(json!({"trigger": "monthly"})))),
            None
        );

        let bad_mode = json!({"service": {"name": "weather", "mode": "poll", "configuration": {}}});
        assert_eq!(registry.register(&sensor_conf("d", bad_mode)), None);

        assert!(registry.is_empty());
        assert!(scheduler.jobs().is_empty());
    }

    #[test]
    fn test_scheduling_failure_still_registers() {
        let (registry, scheduler) = registry(true);
        scheduler.reject_adds(true);
        let id = registry.register(&sensor_conf(
            "outdoor",
            pull_sensor(json!({"trigger": "interval", "minutes": 5})),
        ));
        assert_eq!(id.as_deref(), Some("outdoor"));
        assert_eq!(registry.job_handle("outdoor"), None);

        // zero-length interval is rejected by the provider, not the registry
        scheduler.reject_adds(false);
        let id = registry.register(&sensor_conf(
            "indoor",
            pull_sensor(json!({"trigger": "interval", "seconds": 0})),
        ));
        assert_eq!(id.as_deref(), Some("indoor"));
        assert_eq!(registry.job_handle("indoor"), None);
    }

    #[test]
    fn test_oversized_interval_gets_no_job() {
        let (registry, scheduler) = registry(false);
        let id = registry.register(&sensor_conf(
            "outdoor",
            pull_sensor(json!({"trigger": "interval", "weeks": 100_000_000u64})),
        ));
        assert_eq!(id.as_deref(), Some("outdoor"));
        assert_eq!(registry.job_handle("outdoor"), None);
        assert!(scheduler.jobs().is_empty());
    }

    #[test]
    fn test_oversized_startup_delay_skips_startup_poll() {
        let scheduler = Arc::new(MemoryScheduler::new());
        let config = ServiceConfig {
            name: "weather".to_string(),
            startup_delay_min_secs: u64::MAX,
            startup_delay_max_secs: u64::MAX,
            ..Default::default()
        };
        let registry = SensorRegistry::new(config, scheduler.clone());
        registry.register(&sensor_conf(
            "outdoor",
            pull_sensor(json!({"trigger": "interval", "minutes": 5})),
        ));

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(registry.job_handle("outdoor"), Some(jobs[0].handle));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let (registry, scheduler) = registry(false);
        let msg = sensor_conf("ghost", json!(null));
        assert_eq!(registry.unregister(&msg), "ghost");
        assert_eq!(registry.unregister(&msg), "ghost");

        registry.register(&sensor_conf(
            "outdoor",
            pull_sensor(json!({"trigger": "interval", "minutes": 5})),
        ));
        let handle = registry.job_handle("outdoor").unwrap();
        assert_eq!(registry.unregister(&sensor_conf("outdoor", json!(null))), "outdoor");
        assert_eq!(scheduler.removed(), vec![handle]);
        assert_eq!(registry.unregister(&sensor_conf("outdoor", json!(null))), "outdoor");
        assert_eq!(scheduler.removed().len(), 1);
    }
}
