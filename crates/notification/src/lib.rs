//! Notification engine: severity filtering, mute windows, hourly rate
//! limiting, and single-flight delivery with a bounded backlog.

pub mod dispatcher;
pub mod gate;
pub mod module;

pub use dispatcher::{Deliverer, NotificationDispatcher, SubmitOutcome};
pub use gate::{AdmitDecision, FilterConfig, NotificationGate, RateState};
pub use module::NotificationModule;
