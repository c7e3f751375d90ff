mod micros;
mod repeater;
mod scheduler;

pub use micros::Micros;
pub use repeater::Repeater;
pub use scheduler::{SchedulerError, TaskConfig, TimedTaskScheduler, TriggerKind};
