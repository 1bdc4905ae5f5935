//! Chat Completions gateway for backends that speak the Responses protocol.

pub mod auth;
pub mod config;
pub mod effort;
pub mod error;
pub mod limits;
pub mod models;
pub mod protocol;
pub mod proxy;
pub mod stream;
pub mod tokens;
pub mod translate;
