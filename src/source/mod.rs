pub mod client;
pub mod parse;

pub use client::{Pacer, RequestGate, SourceClient};
