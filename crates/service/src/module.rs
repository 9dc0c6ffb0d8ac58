//! Service module: sensor registration plus polling for a concrete service.

use std::sync::Arc;

use hub_core::config::ServiceConfig;
use hub_core::{Message, MessageSink};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::registry::SensorRegistry;
use crate::scheduler::{FiredJob, PollTask, ScheduleProvider};

pub const HUB: &str = "controller/hub";

/// Behaviour of a concrete service (weather API, MQTT bridge, ...).
pub trait ServiceHandler: Send + Sync {
    /// Keys a push sensor's configuration must contain.
    fn push_requirements(&self) -> Vec<String> {
        Vec::new()
    }

    /// Handle any message that is not a sensor configuration, most notably
    /// `IN` poll requests.
    fn on_message(&self, service: &ServiceModule, message: &Message) -> anyhow::Result<()>;
}

pub struct ServiceModule {
    fullname: String,
    registry: SensorRegistry,
    handler: Arc<dyn ServiceHandler>,
    sink: Arc<dyn MessageSink>,
}

impl std::fmt::Debug for ServiceModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceModule")
            .field("fullname", &self.fullname)
            .field("sensors", &self.registry.len())
            .finish()
    }
}

impl ServiceModule {
    pub fn new(
        config: &ServiceConfig,
        provider: Arc<dyn ScheduleProvider>,
        handler: Arc<dyn ServiceHandler>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let registry = SensorRegistry::new(config.clone(), provider)
            .with_push_requirements(handler.push_requirements());
        Self {
            fullname: format!("service/{}", config.name),
            registry,
            handler,
            sink,
        }
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn registry(&self) -> &SensorRegistry {
        &self.registry
    }

    /// Publish a message on the bus.
    pub fn send(&self, message: Message) {
        self.sink.send(message);
    }

    /// Configuration paths this module listens to.
    pub fn subscriptions(&self) -> Vec<String> {
        vec!["sensors/#".to_string()]
    }

    pub fn on_message(&self, message: &Message) {
        if message.command == "CONF" && message.args.starts_with("sensors/") {
            if message.is_null() {
                self.registry.unregister(message);
            } else {
                self.registry.register(message);
            }
            return;
        }

        if let Err(e) = self.handler.on_message(self, message) {
            error!(
                module = %self.fullname,
                command = %message.command,
                args = %message.args,
                error = %e,
                "service handler failed"
            );
        }
    }

    /// Turn a fired job into an `IN` request from the hub and handle it.
    pub fn poll(&self, task: &PollTask) {
        debug!(sensor_id = %task.sensor_id, "polling sensor");
        let message = Message::new(
            HUB,
            self.fullname.clone(),
            "IN",
            task.sensor_id.clone(),
            task.configuration.clone(),
        );
        self.on_message(&message);
    }

    /// Feed job firings into the module until the scheduler goes away.
    pub async fn run_jobs(self: Arc<Self>, mut fired: mpsc::UnboundedReceiver<FiredJob>) {
        info!(module = %self.fullname, "job runner started");
        while let Some(job) = fired.recv().await {
            let module = self.clone();
            tokio::task::spawn_blocking(move || module.poll(&job.task));
        }
        info!(module = %self.fullname, "job runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MemoryScheduler;
    use hub_core::message_bus::capture_sink;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<Message>>,
    }

    impl ServiceHandler for RecordingHandler {
        fn on_message(&self, service: &ServiceModule, message: &Message) -> anyhow::Result<()> {
            self.seen.lock().push(message.clone());
            if message.command == "IN" {
                service.send(message.reply(json!({"value": 21})));
                Ok(())
            } else {
                anyhow::bail!("unsupported command {}", message.command)
            }
        }
    }

    fn setup() -> (ServiceModule, Arc<MemoryScheduler>, Arc<RecordingHandler>) {
        let scheduler = Arc::new(MemoryScheduler::new());
        let handler = Arc::new(RecordingHandler::default());
        let sink = capture_sink();
        let config = ServiceConfig {
            name: "weather".to_string(),
            poll_at_startup: false,
            ..Default::default()
        };
        let module = ServiceModule::new(&config, scheduler.clone(), handler.clone(), sink);
        (module, scheduler, handler)
    }

    #[test]
    fn test_fired_job_becomes_in_message() {
        let (module, scheduler, handler) = setup();
        module.on_message(&Message::new(
            "controller/config",
            "*/*",
            "CONF",
            "sensors/outdoor",
            json!({"service": {
                "name": "weather", "mode": "pull",
                "configuration": {"city": "Rome"},
                "schedule": {"trigger": "interval", "minutes": 15}
            }}),
        ));
        assert_eq!(module.registry().sensor_ids(), vec!["outdoor"]);
        // configuration messages never reach the handler
        assert!(handler.seen.lock().is_empty());

        let handle = module.registry().job_handle("outdoor").unwrap();
        let task = scheduler.fire(&handle).unwrap();
        module.poll(&task);

        let seen = handler.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].sender, HUB);
        assert_eq!(seen[0].recipient, "service/weather");
        assert_eq!(seen[0].command, "IN");
        assert_eq!(seen[0].args, "outdoor");
        assert_eq!(seen[0].payload, json!({"city": "Rome"}));
    }

    #[test]
    fn test_deleted_sensor_configuration_unregisters() {
        let (module, scheduler, _) = setup();
        let conf = |payload| Message::new("controller/config", "*/*", "CONF", "sensors/outdoor", payload);
        module.on_message(&conf(json!({"service": {
            "name": "weather", "mode": "pull",
            "configuration": {}, "schedule": {"trigger": "interval", "hours": 1}
        }})));
        assert_eq!(scheduler.list().len(), 1);

        module.on_message(&conf(json!(null)));
        assert!(module.registry().is_empty());
        assert!(scheduler.list().is_empty());
    }

    #[test]
    fn test_handler_errors_are_absorbed() {
        let (module, _, handler) = setup();
        module.on_message(&Message::new("gui/web", "service/weather", "SET", "x", json!(1)));
        assert_eq!(handler.seen.lock().len(), 1);
    }
}
