pub mod keys;
pub mod memory;
pub mod replay;
pub mod store;
