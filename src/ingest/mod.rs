pub mod cache;
pub mod engine;
pub mod worker;

pub use worker::{supervise, WorkerContext, WorkerState};
