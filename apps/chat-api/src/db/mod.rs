pub mod chats;
pub mod device_tokens;
pub mod pool;
pub mod schema;
