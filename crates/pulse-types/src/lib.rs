pub mod api;
pub mod error;
pub mod frames;
pub mod models;
pub mod reconcile;
