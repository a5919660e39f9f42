//! The HTTP surface of the vigil server: axum routing for the v1
//! authentication and registration endpoints, the per-tenant OIDC
//! discovery document, and configuration loading for the daemon.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod https;
