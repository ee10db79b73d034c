pub mod auth;
pub mod consumer;
pub mod handlers;
pub mod rooms;
pub mod server;
pub mod websocket;

pub use rooms::RoomRegistry;
pub use server::run;
