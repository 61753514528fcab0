pub mod app;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod model_registry;
pub mod stream;
pub mod upstream;
