pub mod api;
pub mod auth;
pub mod auth_middleware;
pub mod cipher;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod keystore;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod replay;
pub mod signer;
