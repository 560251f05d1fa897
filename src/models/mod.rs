//! Core data models for the chunked upload / pickup-code service.
//!
//! These records are the system of record held in memory by the services
//! and written out verbatim (via `serde`) by the persistence layer.

pub mod artifact;
pub mod retrieval;
pub mod upload;
