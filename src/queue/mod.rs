pub mod ready_queue;
pub mod task_queue;

pub use ready_queue::ReadyQueue;
pub use task_queue::{TaskOutcome, TaskQueue};
