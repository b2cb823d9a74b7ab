use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use uuid::Uuid;

use crate::{error::AccountError, users::AccountService};

/// Token from `Bearer <token>`; the scheme name is case-insensitive.
fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

/// Verified subject of a bearer token. Protected handlers take this as an
/// explicit argument; there is no other way to reach them.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    AccountService: FromRef<S>,
{
    type Rejection = AccountError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let accounts = AccountService::from_ref(state);

        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| AccountError::unauthorized("Not authorized, no token"))?;

        let token = bearer_token(auth)
            .ok_or_else(|| AccountError::unauthorized("Invalid auth scheme"))?;

        accounts.authenticate(token).map(AuthUser)
    }
}
