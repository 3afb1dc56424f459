pub mod config;
pub mod context;
pub mod error;
pub mod value;

pub use config::FrameworkConfig;
pub use context::{CurrentUser, RequestContext, SUPER_ADMIN_ROLE_ID, SYSTEM_ROLE_ID, UserRole};
pub use error::{ConversionErrorCode, DomainError, ErrorPayload, Result};
pub use value::Value;
