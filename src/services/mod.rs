pub mod chunk_store;
pub mod gc;
pub mod persistence;
pub mod registry;
pub mod share_service;
pub mod upload_tracker;
