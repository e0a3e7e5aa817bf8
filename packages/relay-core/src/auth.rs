//! Auth resolver: maps API bearer tokens to a `User` and enforces device
//! ownership. Password/session login is out of scope here — this module
//! never sees a password.

use thiserror::Error;

use crate::store::{self, DbPool, Device, StoreError, User};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication required")]
    AuthRequired,
    #[error("invalid API token")]
    InvalidApiToken,
    #[error("device not found")]
    DeviceNotFound,
}

pub struct AuthResolver;

impl AuthResolver {
    /// Resolve a bearer token to its owning user. Accepts both the
    /// `Authorization: Bearer <token>` and `X-API-Token: <token>` forms —
    /// callers strip the scheme before calling this.
    pub fn resolve_token(pool: &DbPool, token: Option<&str>) -> Result<User, AuthError> {
        let token = token.ok_or(AuthError::AuthRequired)?;
        if token.is_empty() {
            return Err(AuthError::AuthRequired);
        }
        match store::find_user_by_token(pool, token) {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(AuthError::InvalidApiToken),
            Err(_) => Err(AuthError::InvalidApiToken),
        }
    }

    /// Resolve `device_id`, requiring it to be owned by `user`.
    pub fn resolve_owned_device(
        pool: &DbPool,
        user: &User,
        device_id: &str,
    ) -> Result<Device, AuthError> {
        match store::find_device_owned_by(pool, device_id, &user.id) {
            Ok(Some(device)) => Ok(device),
            Ok(None) => Err(AuthError::DeviceNotFound),
            Err(_) => Err(AuthError::DeviceNotFound),
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(_: StoreError) -> Self {
        AuthError::InvalidApiToken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_is_auth_required() {
        let pool = store::open_memory_pool().unwrap();
        let err = AuthResolver::resolve_token(&pool, None).unwrap_err();
        assert_eq!(err, AuthError::AuthRequired);
    }

    #[test]
    fn unknown_token_is_invalid() {
        let pool = store::open_memory_pool().unwrap();
        let err = AuthResolver::resolve_token(&pool, Some("nope")).unwrap_err();
        assert_eq!(err, AuthError::InvalidApiToken);
    }

    #[test]
    fn resolves_valid_token_to_its_owner() {
        let pool = store::open_memory_pool().unwrap();
        let user = store::create_user(&pool, "alice", 5).unwrap();

        let resolved = AuthResolver::resolve_token(&pool, Some(&user.api_token)).unwrap();
        assert_eq!(resolved.id, user.id);
    }

    #[test]
    fn device_owned_by_a_different_user_is_not_found() {
        let pool = store::open_memory_pool().unwrap();
        let owner = store::create_user(&pool, "alice", 5).unwrap();
        let other = store::create_user(&pool, "mallory", 5).unwrap();
        store::upsert_device(&pool, &owner, "dev-1", None).unwrap();

        let err = AuthResolver::resolve_owned_device(&pool, &other, "dev-1").unwrap_err();
        assert_eq!(err, AuthError::DeviceNotFound);
    }
}
