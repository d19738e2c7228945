pub mod chat_message;
pub mod chat_participant;
pub mod device_token;
