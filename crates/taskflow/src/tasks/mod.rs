pub mod memory;
pub mod model;
pub mod observer;
pub mod repo;
pub mod retry;
pub mod store;

pub use memory::MemoryStore;
pub use model::{
    dead_letter_queue, NewTask, QueueStats, SpawnOutcome, Task, TaskFilter, TaskPage, TaskStatus,
};
pub use observer::{NoopObserver, TaskObserver, TracingObserver};
pub use repo::PgStore;
pub use retry::RetryConfig;
pub use store::{FailureApplied, ScheduleStore, Spawned, Store, TaskStore, WorkflowStore};
