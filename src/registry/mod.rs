pub mod family;
pub mod record;
pub mod replica;
