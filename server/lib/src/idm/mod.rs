//! The identity management core: accounts, session tokens, MFA challenges,
//! and the two server-driven state machines that orchestrate them.

pub mod account;
pub mod authsession;
pub mod challenge;
pub mod delayed;
pub mod regsession;
pub mod server;
pub mod token;
