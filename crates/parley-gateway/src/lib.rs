pub mod connection;
pub mod presence;
pub mod push;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod session;
pub mod store;
