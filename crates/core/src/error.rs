use thiserror::Error;

pub type ModuleResult<T> = Result<T, ModuleError>;

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Notification backlog full (capacity {capacity})")]
    BacklogFull { capacity: usize },
}
