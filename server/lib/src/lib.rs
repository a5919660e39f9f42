//! The Vigil server library. This implements the protocol core of the
//! portal: credential verification, multi-factor challenges, the single
//! use session token stores, and the server-driven authentication and
//! registration state machines. The HTTP surface lives in vigild_core and
//! calls in through [`idm::server::IdmServer`].

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
mod macros;

pub mod be;
pub mod credential;
pub mod idm;
pub mod prelude;
pub mod tenant;
pub mod utils;
