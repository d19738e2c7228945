pub mod events;
pub mod fanout;
pub mod heartbeat;
mod membership;
pub mod registry;
pub mod server;
pub mod session;
