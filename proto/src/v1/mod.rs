//! Version 1 of the login and registration wire protocol.

mod auth;
mod register;
mod totp;

pub use self::auth::*;
pub use self::register::*;
pub use self::totp::*;
