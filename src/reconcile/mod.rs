pub mod business;
pub mod follower;
pub mod kill;
pub mod leader;
pub mod messages;
