pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use errors::*;
pub use models::{
    NewTask, NewTemplate, ScheduleKind, ScheduledTemplate, Task, TaskStatus, TemplateStatus,
    User, Worker,
};
pub use traits::TaskStore;

#[cfg(any(test, feature = "mock"))]
pub use traits::MockTaskStore;
