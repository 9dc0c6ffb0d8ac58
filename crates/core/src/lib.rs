pub mod config;
pub mod error;
pub mod message_bus;
pub mod schema;
pub mod types;

pub use config::{AppConfig, BackpressurePolicy};
pub use error::{ModuleError, ModuleResult};
pub use message_bus::MessageSink;
pub use schema::is_valid_configuration;
pub use types::{Message, Severity};
