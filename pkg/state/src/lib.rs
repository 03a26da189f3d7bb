pub mod client;
pub mod lock;
pub mod registry;
