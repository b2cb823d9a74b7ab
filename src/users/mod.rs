use crate::state::AppState;
use axum::Router;

pub mod dto;
pub(crate) mod extractors;
pub mod handlers;
pub mod repo;
pub mod repo_types;
pub mod services;

pub use services::AccountService;

pub fn router() -> Router<AppState> {
    handlers::user_routes()
}
