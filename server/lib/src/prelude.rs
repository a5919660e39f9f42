pub use std::time::Duration;

pub use tracing;
pub use url::Url;
pub use uuid::Uuid;

pub use vigil_proto::OperationError;

pub use crate::utils::duration_from_epoch_now;
pub use crate::{
    admin_error, admin_info, admin_warn, request_error, security_critical, security_debug,
    security_error, security_info,
};
