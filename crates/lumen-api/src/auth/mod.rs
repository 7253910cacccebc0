//! Request principal extraction.
//!
//! Protected handlers take an [`AuthPrincipal`] argument; public handlers simply don't.

pub mod jwt;
pub mod models;

pub use jwt::JwtService;
pub use models::{AuthPrincipal, AuthState, JwtClaims};
