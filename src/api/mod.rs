pub mod chat_api;
pub mod data_models;

pub mod chunk_segmenter;
pub mod config_manager;
pub mod conversation_store;
pub mod delta_reconciler;
pub mod error_handler;
pub mod im_gateway;
pub mod outbound_delivery;
pub mod stream_router;
pub mod streaming_handler;
pub mod turn_state;
