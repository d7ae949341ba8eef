//! Background Remover job service
//!
//! Admission, scheduling and lifecycle tracking for background-removal
//! jobs. Uploads are either processed inline or queued; a dispatcher moves
//! queued jobs into a bounded set of worker slots and finished results are
//! kept on disk for later retrieval.

pub mod app_state;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
