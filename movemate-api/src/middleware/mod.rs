pub mod auth;

pub use auth::{admin_only_middleware, auth_middleware, Claims};
