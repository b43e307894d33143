//! Forwarding tasks: data model and the mutation surface.

pub mod manager;
pub mod model;

pub use manager::TaskManager;
pub use model::{NewTask, Task, TaskConfig, TaskMode};
