pub mod auth;
pub mod handlers;
pub mod metrics;
pub mod presence;
pub mod rooms;
pub mod server;
pub mod sessions;

pub use server::{start, AppState, ServerConfig, ServerHandle};
