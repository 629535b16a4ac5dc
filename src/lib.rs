pub mod app;
pub mod auth;
pub mod classify;
pub mod error;
pub mod handlers;
pub mod store;
pub mod upstream;
pub mod usage;
