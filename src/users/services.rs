//! Credential and session-token lifecycle.
//!
//! Every protected operation takes the subject id produced by
//! [`AccountService::authenticate`] and resolves it against the store on each
//! call, so a deleted account stops working immediately for any token that
//! still verifies.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    dto::{AuthResponse, ChangePasswordRequest, LoginRequest, PublicUser, RegisterRequest},
    repo::UserStore,
};
use crate::{
    auth::{JwtKeys, PasswordHasher},
    error::{AccountError, AccountResult},
};

const INVALID_CREDENTIALS: &str = "Invalid credentials";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Emails are compared case-insensitively; this is the stored form.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn require(value: &str, msg: &str) -> AccountResult<()> {
    if value.trim().is_empty() {
        return Err(AccountError::validation(msg));
    }
    Ok(())
}

#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn UserStore>,
    keys: JwtKeys,
    hasher: PasswordHasher,
    // Verified against on unknown-email logins so both failure paths cost a hash.
    decoy_hash: Arc<str>,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn UserStore>,
        keys: JwtKeys,
        hasher: PasswordHasher,
    ) -> anyhow::Result<Self> {
        let decoy_hash = hasher.hash(&Uuid::new_v4().to_string())?.into();
        Ok(Self {
            store,
            keys,
            hasher,
            decoy_hash,
        })
    }

    #[instrument(skip(self, req), fields(email = %req.email))]
    pub async fn register(&self, req: RegisterRequest) -> AccountResult<AuthResponse> {
        require(&req.name, "Please add all fields")?;
        require(&req.email, "Please add all fields")?;
        require(&req.password, "Please add all fields")?;

        let email = normalize_email(&req.email);
        if !is_valid_email(&email) {
            warn!(email = %email, "invalid email");
            return Err(AccountError::validation("Invalid email"));
        }

        if self.store.find_by_email(&email).await?.is_some() {
            warn!(email = %email, "email already registered");
            return Err(AccountError::Conflict("User already exists".into()));
        }

        let hash = self.hasher.hash_async(req.password).await?;
        // A concurrent registration can still win the race; the store reports it as a conflict.
        let user = self.store.insert(req.name.trim(), &email, &hash).await?;
        let token = self.keys.issue(user.id)?;

        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(AuthResponse {
            user: user.into(),
            token,
        })
    }

    #[instrument(skip(self, req), fields(email = %req.email))]
    pub async fn login(&self, req: LoginRequest) -> AccountResult<AuthResponse> {
        require(&req.email, "Please add all fields")?;
        require(&req.password, "Please add all fields")?;

        let email = normalize_email(&req.email);
        let Some(user) = self.store.find_by_email(&email).await? else {
            PasswordHasher::verify_async(req.password, self.decoy_hash.to_string()).await?;
            warn!(email = %email, "login unknown email");
            return Err(AccountError::unauthorized(INVALID_CREDENTIALS));
        };

        let ok = PasswordHasher::verify_async(req.password, user.password_hash.clone()).await?;
        if !ok {
            warn!(email = %email, user_id = %user.id, "login invalid password");
            return Err(AccountError::unauthorized(INVALID_CREDENTIALS));
        }

        let token = self.keys.issue(user.id)?;
        info!(user_id = %user.id, "user logged in");
        Ok(AuthResponse {
            user: user.into(),
            token,
        })
    }

    /// Resolves a bearer token to its subject. Required before any of the
    /// operations below.
    pub fn authenticate(&self, token: &str) -> AccountResult<Uuid> {
        self.keys.verify(token)
    }

    #[instrument(skip(self))]
    pub async fn profile(&self, user_id: Uuid) -> AccountResult<PublicUser> {
        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or_else(AccountError::user_not_found)?;
        Ok(user.into())
    }

    #[instrument(skip(self, req))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        req: ChangePasswordRequest,
    ) -> AccountResult<()> {
        const MISSING: &str = "Current password and new password are required fields";
        require(&req.current_password, MISSING)?;
        require(&req.new_password, MISSING)?;

        let user = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or_else(AccountError::user_not_found)?;

        let ok = PasswordHasher::verify_async(req.current_password, user.password_hash).await?;
        if !ok {
            warn!(user_id = %user_id, "change password with wrong current password");
            return Err(AccountError::unauthorized("Invalid current password"));
        }

        let hash = self.hasher.hash_async(req.new_password).await?;
        self.store.update_password_hash(user_id, &hash).await?;

        info!(user_id = %user_id, "password changed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_account(&self, user_id: Uuid) -> AccountResult<PublicUser> {
        let user = self.store.delete_by_id(user_id).await?;
        info!(user_id = %user_id, "user deleted");
        Ok(user.into())
    }
}

#[cfg(test)]
pub(crate) fn test_service() -> (AccountService, Arc<crate::users::repo::MemoryUserStore>) {
    use crate::{auth::password::cheap_config, config::JwtConfig, users::repo::MemoryUserStore};

    let store = Arc::new(MemoryUserStore::default());
    let keys = JwtKeys::new(&JwtConfig {
        secret: "test-secret".into(),
    });
    let hasher = PasswordHasher::new(&cheap_config()).expect("valid params");
    let service = AccountService::new(store.clone(), keys, hasher).expect("service");
    (service, store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_req(name: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            name: name.into(),
            email: email.into(),
            password: password.into(),
        }
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.into(),
            password: password.into(),
        }
    }

    fn change_req(current: &str, new: &str) -> ChangePasswordRequest {
        ChangePasswordRequest {
            current_password: current.into(),
            new_password: new.into(),
        }
    }

    #[test]
    fn email_shape() {
        assert!(is_valid_email("a@x.com"));
        assert!(!is_valid_email("a@x"));
        assert!(!is_valid_email("a b@x.com"));
        assert!(!is_valid_email("not-an-email"));
    }

    #[tokio::test]
    async fn register_then_login_returns_same_id() {
        let (svc, _) = test_service();
        let reg = svc.register(register_req("Bob", "bob@x.com", "hunter2")).await.unwrap();
        let login = svc.login(login_req("bob@x.com", "hunter2")).await.unwrap();

        assert_eq!(reg.user.id, login.user.id);
        assert_eq!(login.user.name, "Bob");
        assert_eq!(svc.authenticate(&reg.token).unwrap(), reg.user.id);
    }

    #[tokio::test]
    async fn register_rejects_empty_fields() {
        let (svc, store) = test_service();
        for req in [
            register_req("", "a@x.com", "pw"),
            register_req("A", "  ", "pw"),
            register_req("A", "a@x.com", ""),
        ] {
            assert!(matches!(
                svc.register(req).await,
                Err(AccountError::Validation(_))
            ));
        }
        assert!(matches!(
            svc.register(register_req("A", "nope", "pw")).await,
            Err(AccountError::Validation(_))
        ));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_email_always_conflicts() {
        let (svc, store) = test_service();
        svc.register(register_req("A", "a@x.com", "pw")).await.unwrap();
        for _ in 0..3 {
            assert!(matches!(
                svc.register(register_req("B", "a@x.com", "other")).await,
                Err(AccountError::Conflict(_))
            ));
        }
        assert!(matches!(
            svc.register(register_req("C", " A@X.com ", "pw")).await,
            Err(AccountError::Conflict(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_registration_has_one_winner() {
        let (svc, store) = test_service();
        let a = svc.clone();
        let b = svc.clone();
        let (ra, rb) = tokio::join!(
            a.register(register_req("A", "race@x.com", "pw")),
            b.register(register_req("B", "race@x.com", "pw")),
        );
        let oks = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(oks, 1);
        let loser = if ra.is_err() { ra } else { rb };
        assert!(matches!(loser, Err(AccountError::Conflict(_))));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn stored_hash_is_not_the_password() {
        let (svc, store) = test_service();
        let reg = svc.register(register_req("A", "a@x.com", "pw123")).await.unwrap();
        let user = store.find_by_id(reg.user.id).await.unwrap().unwrap();
        assert!(!user.password_hash.is_empty());
        assert_ne!(user.password_hash, "pw123");
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let (svc, _) = test_service();
        svc.register(register_req("A", "a@x.com", "pw")).await.unwrap();

        let wrong_pw = svc.login(login_req("a@x.com", "bad")).await.unwrap_err();
        let unknown = svc.login(login_req("ghost@x.com", "pw")).await.unwrap_err();

        assert!(matches!(wrong_pw, AccountError::Authentication(_)));
        assert!(matches!(unknown, AccountError::Authentication(_)));
        assert_eq!(wrong_pw.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn login_requires_both_fields() {
        let (svc, _) = test_service();
        assert!(matches!(
            svc.login(login_req("", "pw")).await,
            Err(AccountError::Validation(_))
        ));
        assert!(matches!(
            svc.login(login_req("a@x.com", "")).await,
            Err(AccountError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn change_password_rotates_hash_and_keeps_tokens() {
        let (svc, store) = test_service();
        let reg = svc.register(register_req("A", "a@x.com", "old")).await.unwrap();
        let before = store.find_by_id(reg.user.id).await.unwrap().unwrap().password_hash;

        svc.change_password(reg.user.id, change_req("old", "new")).await.unwrap();

        let after = store.find_by_id(reg.user.id).await.unwrap().unwrap().password_hash;
        assert_ne!(before, after);
        assert!(svc.login(login_req("a@x.com", "old")).await.is_err());
        assert!(svc.login(login_req("a@x.com", "new")).await.is_ok());

        let id = svc.authenticate(&reg.token).unwrap();
        assert_eq!(svc.profile(id).await.unwrap().email, "a@x.com");
    }

    #[tokio::test]
    async fn change_password_checks_current_and_inputs() {
        let (svc, _) = test_service();
        let reg = svc.register(register_req("A", "a@x.com", "old")).await.unwrap();

        assert!(matches!(
            svc.change_password(reg.user.id, change_req("wrong", "new")).await,
            Err(AccountError::Authentication(_))
        ));
        assert!(matches!(
            svc.change_password(reg.user.id, change_req("", "new")).await,
            Err(AccountError::Validation(_))
        ));
        assert!(matches!(
            svc.change_password(reg.user.id, change_req("old", "")).await,
            Err(AccountError::Validation(_))
        ));
        assert!(svc.login(login_req("a@x.com", "old")).await.is_ok());
    }

    #[tokio::test]
    async fn deleted_account_is_gone_for_every_operation() {
        let (svc, _) = test_service();
        let reg = svc.register(register_req("A", "a@x.com", "pw")).await.unwrap();
        let id = reg.user.id;

        let deleted = svc.delete_account(id).await.unwrap();
        assert_eq!(deleted.email, "a@x.com");

        // The token still verifies; the subject no longer resolves.
        assert_eq!(svc.authenticate(&reg.token).unwrap(), id);
        assert!(matches!(svc.profile(id).await, Err(AccountError::NotFound(_))));
        assert!(matches!(
            svc.change_password(id, change_req("pw", "x")).await,
            Err(AccountError::NotFound(_))
        ));
        assert!(matches!(svc.delete_account(id).await, Err(AccountError::NotFound(_))));

        let again = svc.register(register_req("A2", "a@x.com", "pw")).await.unwrap();
        assert_ne!(again.user.id, id);
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let (svc, _) = test_service();

        let t1 = svc.register(register_req("Alice", "a@x.com", "pw123")).await.unwrap();
        let t2 = svc.login(login_req("a@x.com", "pw123")).await.unwrap();
        assert_ne!(t1.token, t2.token);
        assert_eq!(t1.user.id, t2.user.id);

        let id = svc.authenticate(&t1.token).unwrap();
        assert_eq!(
            svc.profile(id).await.unwrap(),
            PublicUser {
                id: t1.user.id,
                name: "Alice".into(),
                email: "a@x.com".into(),
            }
        );

        svc.change_password(id, change_req("pw123", "pw456")).await.unwrap();
        assert!(matches!(
            svc.login(login_req("a@x.com", "pw123")).await,
            Err(AccountError::Authentication(_))
        ));

        svc.delete_account(id).await.unwrap();
        let id2 = svc.authenticate(&t2.token).unwrap();
        assert!(matches!(svc.profile(id2).await, Err(AccountError::NotFound(_))));
    }
}
