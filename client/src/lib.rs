//! freva-client — command line access to the databrowser REST API.

pub mod auth;
pub mod config;
pub mod databrowser;

pub use config::Config;
