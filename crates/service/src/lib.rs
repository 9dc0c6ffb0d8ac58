//! Sensor services: registration of pull/push sensors and polling schedules.

pub mod module;
pub mod registry;
pub mod scheduler;
pub mod trigger;

pub use module::{ServiceHandler, ServiceModule};
pub use registry::{SensorMode, SensorRecord, SensorRegistry};
pub use scheduler::{
    FiredJob, JobHandle, JobSpec, MemoryScheduler, PollTask, ScheduleProvider, TokioScheduler,
};
pub use trigger::Trigger;
