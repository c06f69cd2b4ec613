pub mod handler;
pub mod route;

pub use handler::{AppState, GatewayServer};
