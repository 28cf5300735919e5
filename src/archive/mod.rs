pub mod sweeper;

pub use sweeper::{ArchiveSweeper, SweepReport};
