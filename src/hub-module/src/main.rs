//! Hub module host: runs a notification module and a sensor service module
//! against a JSON-lines bus on stdin/stdout.

mod adapters;

use std::net::SocketAddr;
use std::sync::Arc;

use adapters::{EchoService, LogDeliverer, StdoutSink};
use clap::Parser;
use hub_core::config::{AppConfig, MetricsConfig};
use hub_core::Message;
use hub_notification::NotificationModule;
use hub_service::{ServiceModule, TokioScheduler};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const BUS_BUFFER: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "hub-module")]
#[command(about = "Notification and sensor-polling module host")]
#[command(version)]
struct Cli {
    /// Module scope (overrides config)
    #[arg(long, env = "HUB_MODULE__MODULE__SCOPE")]
    scope: Option<String>,

    /// Module name (overrides config)
    #[arg(long, env = "HUB_MODULE__MODULE__NAME")]
    name: Option<String>,

    /// Service name sensors bind to (overrides config)
    #[arg(long, env = "HUB_MODULE__SERVICE__NAME")]
    service: Option<String>,

    /// Do not poll pull sensors right after they register
    #[arg(long, default_value_t = false)]
    no_startup_poll: bool,
}

/// Whether a module named `fullname` should see `message`.
fn addressed_to(fullname: &str, message: &Message) -> bool {
    message.recipient == fullname
        || message.recipient == "*/*"
        || (message.command == "CONF" && message.args.starts_with("sensors/"))
        || message.sender == hub_notification::module::ALERTER
}

/// Hands bus messages to the hosted modules one at a time, in arrival order.
struct BusRouter {
    notifier: Arc<NotificationModule>,
    service: Arc<ServiceModule>,
}

impl BusRouter {
    fn dispatch(&self, message: &Message) {
        if addressed_to(self.notifier.fullname(), message) {
            self.notifier.on_message(message);
        }
        if addressed_to(self.service.fullname(), message) {
            self.service.on_message(message);
        }
    }

    /// Blocks until every sender is dropped.
    fn run(&self, mut inbox: mpsc::Receiver<Message>) {
        while let Some(message) = inbox.blocking_recv() {
            self.dispatch(&message);
        }
    }
}

/// Start the Prometheus exporter on its own port.
fn start_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], config.port)))
        .install()?;
    info!(port = config.port, "Metrics exporter started");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the bus; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hub_module=info,hub_notification=info,hub_service=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    info!("Hub module starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(scope) = cli.scope {
        config.module.scope = scope;
    }
    if let Some(name) = cli.name {
        config.module.name = name;
    }
    if let Some(service) = cli.service {
        config.service.name = service;
    }
    if cli.no_startup_poll {
        config.service.poll_at_startup = false;
    }

    info!(
        module = %config.module.fullname(),
        service = %config.service.name,
        backlog_capacity = config.notification.backlog_capacity,
        poll_at_startup = config.service.poll_at_startup,
        "Configuration loaded"
    );

    if let Err(e) = start_metrics(&config.metrics) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let notifier = Arc::new(NotificationModule::new(
        config.module.fullname(),
        Arc::new(LogDeliverer),
        &config.notification,
    ));

    let (scheduler, fired) = TokioScheduler::new();
    let service = Arc::new(ServiceModule::new(
        &config.service,
        Arc::new(scheduler),
        Arc::new(EchoService),
        Arc::new(StdoutSink),
    ));
    tokio::spawn(service.clone().run_jobs(fired));

    info!(
        notifier = %notifier.fullname(),
        service = %service.fullname(),
        subscriptions = ?service.subscriptions(),
        "Modules ready, reading bus messages from stdin"
    );

    let router = BusRouter {
        notifier: notifier.clone(),
        service: service.clone(),
    };
    let (bus, inbox) = mpsc::channel(BUS_BUFFER);
    let worker = tokio::task::spawn_blocking(move || router.run(inbox));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed, waiting for shutdown signal");
                    tokio::signal::ctrl_c().await?;
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let message: Message = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed bus message");
                        continue;
                    }
                };
                if bus.send(message).await.is_err() {
                    error!("Bus worker stopped, shutting down");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(bus);
    if let Err(e) = worker.await {
        error!(error = %e, "Bus worker failed");
    }

    info!(stats = ?notifier.stats(), sensors = service.registry().len(), "Hub module shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::config::{NotificationConfig, ServiceConfig};
    use hub_core::message_bus::capture_sink;
    use hub_service::{MemoryScheduler, ScheduleProvider};
    use serde_json::json;

    fn router() -> (BusRouter, Arc<MemoryScheduler>) {
        let scheduler = Arc::new(MemoryScheduler::new());
        let config = ServiceConfig {
            poll_at_startup: false,
            ..Default::default()
        };
        let router = BusRouter {
            notifier: Arc::new(NotificationModule::new(
                "notification/console",
                Arc::new(LogDeliverer),
                &NotificationConfig::default(),
            )),
            service: Arc::new(ServiceModule::new(
                &config,
                scheduler.clone(),
                Arc::new(EchoService),
                capture_sink(),
            )),
        };
        (router, scheduler)
    }

    #[test]
    fn test_routing() {
        let conf = Message::new("controller/config", "*/*", "CONF", "sensors/a", json!({}));
        assert!(addressed_to("service/echo", &conf));

        let direct = Message::new("gui/web", "notification/console", "RUN", "info", json!("x"));
        assert!(addressed_to("notification/console", &direct));
        assert!(!addressed_to("service/echo", &direct));

        let alert = Message::new("controller/alerter", "controller/hub", "NOTIFY", "alert", json!("x"));
        assert!(addressed_to("notification/console", &alert));
    }

    #[test]
    fn test_bus_messages_are_handled_in_order() {
        let (router, scheduler) = router();
        let sensor = json!({"service": {
            "name": "echo",
            "mode": "pull",
            "configuration": {},
            "schedule": {"trigger": "interval", "minutes": 1}
        }});
        let (bus, inbox) = mpsc::channel(8);
        let messages = [
            Message::new("controller/config", "*/*", "CONF", "sensors/x", sensor),
            Message::new("controller/config", "*/*", "CONF", "sensors/x", json!(null)),
            Message::new("controller/config", "*/*", "CONF", "notification/console", json!({})),
            Message::new("controller/alerter", "*/*", "NOTIFY", "alert", json!("smoke")),
        ];
        for message in messages {
            bus.blocking_send(message).unwrap();
        }
        drop(bus);
        router.run(inbox);

        assert!(router.service.registry().is_empty());
        assert!(scheduler.list().is_empty());
        assert_eq!(scheduler.removed().len(), 1);
        assert_eq!(router.notifier.stats().delivered, 1);
    }
}
