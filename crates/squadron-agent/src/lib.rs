pub mod fake;
pub mod process;

pub use process::{ProcessWorker, ProcessWorkerConfig};
