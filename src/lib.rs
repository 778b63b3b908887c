pub mod api;

pub use api::chat_api::{build_router, spawn_eviction, AppState};
pub use api::config_manager::{ConfigManager, GatewaySettings};
pub use api::error_handler::ChatError;
