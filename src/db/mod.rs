pub mod models;
pub mod store;
pub mod writer;

pub use store::Store;
pub use writer::EventWrite;
