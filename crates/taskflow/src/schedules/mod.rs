pub mod cron;
pub mod model;
pub mod scheduler;

pub use cron::{CronError, CronExpr};
pub use model::{Schedule, ScheduleFired, ScheduleSpec, ScheduleUpdate};
pub use scheduler::CronScheduler;
