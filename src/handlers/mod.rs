pub mod health_handlers;
pub mod retrieval_handlers;
pub mod upload_handlers;
