//! Lumen API Library
//!
//! HTTP handlers, auth principal extraction and application setup.

mod api_doc;
pub mod auth;
pub mod constants;
pub mod error;
mod handlers;
pub mod setup;
pub mod state;

pub use api_doc::ApiDoc;
pub use error::{ErrorResponse, HttpAppError};
pub use setup::{build_state, initialize_app, App, BackgroundTasks, ServiceDeps};
pub use state::AppState;
