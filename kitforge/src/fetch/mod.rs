pub mod cache;
pub mod harness;
pub mod spider;
