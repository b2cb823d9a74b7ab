use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use crate::{
    auth::AuthUser,
    error::AccountResult,
    state::AppState,
    users::{
        dto::{
            AuthResponse, ChangePasswordRequest, LoginRequest, MessageResponse, PublicUser,
            RegisterRequest,
        },
        extractors::JsonBody,
    },
};

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(register).delete(delete_user))
        .route("/users/login", post(login))
        .route("/users/me", get(get_me))
        .route("/users/changepassword", post(change_password))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<RegisterRequest>,
) -> AccountResult<(StatusCode, Json<AuthResponse>)> {
    let res = state.accounts.register(payload).await?;
    Ok((StatusCode::CREATED, Json(res)))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> AccountResult<Json<AuthResponse>> {
    Ok(Json(state.accounts.login(payload).await?))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AccountResult<Json<PublicUser>> {
    Ok(Json(state.accounts.profile(user_id).await?))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    JsonBody(payload): JsonBody<ChangePasswordRequest>,
) -> AccountResult<Json<MessageResponse>> {
    state.accounts.change_password(user_id, payload).await?;
    Ok(Json(MessageResponse {
        message: "Password changed successfully.".into(),
    }))
}

#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AccountResult<Json<MessageResponse>> {
    let user = state.accounts.delete_account(user_id).await?;
    Ok(Json(MessageResponse {
        message: format!("User {} account deleted successfully.", user.email),
    }))
}
