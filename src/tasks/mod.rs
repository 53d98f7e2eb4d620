//! Tasks, agents and the task-update audit log.

pub mod model;

pub use model::{Agent, AgentStatus, OutputFormat, Task, TaskStatus, TaskUpdate, UpdateType};
