//! freva-rest — REST API for searching, ingesting and streaming federated
//! climate datasets.
//!
//! The crate is organized along the service's seams: [`flavour`] and
//! [`query`] translate and compile searches, [`solr`] executes them against
//! the external index, [`ingest`] dual-writes user records, [`auth`] gates
//! protected routes via OIDC, and [`portal`] re-exposes remote datasets as
//! a chunk-addressable store backed by the shared cache and the worker
//! pool.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod flavour;
pub mod ingest;
pub mod mongo;
pub mod portal;
pub mod query;
pub mod solr;
pub mod types;

pub use config::ServerConfig;
pub use error::ApiError;
pub use types::AppContext;
