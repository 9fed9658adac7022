pub mod engine;
pub mod syncer;
