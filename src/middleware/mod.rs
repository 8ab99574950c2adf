pub mod auth;

pub use auth::{AuthContext, AuthState, auth_middleware, require_admin};
