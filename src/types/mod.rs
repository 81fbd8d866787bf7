pub mod events;
pub mod id;
pub mod user;
