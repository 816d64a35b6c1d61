pub mod auth;
pub mod chats;
pub mod messages;
pub mod middleware;
