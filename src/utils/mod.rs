pub mod collection_ext;
pub mod error;
pub mod jwt;
pub mod scheduled_executor;
pub mod string_ext;

pub use collection_ext::{group_by, unique_ordered, vec_to_map};
pub use error::{ApiError, ApiResult};
pub use jwt::JwtUtil;
pub use scheduled_executor::{ScheduledExecutor, ScheduledTask};
pub use string_ext::{StringExt, clean_optional_string, trim_string};
