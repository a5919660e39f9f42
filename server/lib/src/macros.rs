//! Tagged tracing wrappers so log events carry their audience. Security
//! events are the ones an auditor greps for; admin events are operational.

#[macro_export]
macro_rules! admin_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "admin", $($arg)*)
    };
}

#[macro_export]
macro_rules! admin_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "admin", $($arg)*)
    };
}

#[macro_export]
macro_rules! admin_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "admin", $($arg)*)
    };
}

#[macro_export]
macro_rules! security_critical {
    ($($arg:tt)*) => {
        tracing::error!(target: "security", critical = true, $($arg)*)
    };
}

#[macro_export]
macro_rules! security_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "security", $($arg)*)
    };
}

#[macro_export]
macro_rules! security_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "security", $($arg)*)
    };
}

#[macro_export]
macro_rules! security_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "security", $($arg)*)
    };
}

#[macro_export]
macro_rules! request_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "request", $($arg)*)
    };
}
