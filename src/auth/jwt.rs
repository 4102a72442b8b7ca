use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::auth::claims::{AccessClaims, RefreshClaims};
use crate::config::JwtConfig;
use crate::error::AuthError;
use crate::state::AppState;
use crate::users::repo_types::User;

/// Signing/verification material for both token kinds. Access and refresh
/// tokens use independent secrets, so one kind can never verify as the other.
#[derive(Clone)]
pub struct JwtKeys {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        Self::from_config(&state.config.jwt)
    }
}

impl JwtKeys {
    pub fn from_config(cfg: &JwtConfig) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(cfg.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(cfg.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(cfg.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(cfg.refresh_secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            access_ttl: Duration::from_secs((cfg.access_ttl_minutes.max(0) as u64) * 60),
            refresh_ttl: Duration::from_secs((cfg.refresh_ttl_minutes.max(0) as u64) * 60),
        }
    }

    fn window(&self, ttl: Duration) -> (usize, usize) {
        let now = OffsetDateTime::now_utc();
        let exp = now + TimeDuration::seconds(ttl.as_secs() as i64);
        (now.unix_timestamp() as usize, exp.unix_timestamp() as usize)
    }

    /// Signing only fails on misconfiguration, so errors stay `anyhow` and
    /// surface as 500s.
    pub fn sign_access(&self, user: &User) -> anyhow::Result<String> {
        let (iat, exp) = self.window(self.access_ttl);
        let claims = AccessClaims {
            sub: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            iat,
            exp,
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.access_encoding)?;
        debug!(user_id = %user.id, "access token signed");
        Ok(token)
    }

    pub fn sign_refresh(&self, user_id: Uuid) -> anyhow::Result<String> {
        let (iat, exp) = self.window(self.refresh_ttl);
        let claims = RefreshClaims {
            sub: user_id,
            iat,
            exp,
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.refresh_encoding)?;
        debug!(user_id = %user_id, "refresh token signed");
        Ok(token)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::default();
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let data = decode::<AccessClaims>(token, &self.access_decoding, &self.validation())
            .map_err(|e| {
                debug!(error = %e, "access token rejected");
                AuthError::InvalidToken
            })?;
        Ok(data.claims)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        let data = decode::<RefreshClaims>(token, &self.refresh_decoding, &self.validation())
            .map_err(|e| {
                debug!(error = %e, "refresh token rejected");
                AuthError::InvalidToken
            })?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> JwtConfig {
        JwtConfig {
            access_secret: "test-access-secret".into(),
            refresh_secret: "test-refresh-secret".into(),
            issuer: "test-issuer".into(),
            access_ttl_minutes: 5,
            refresh_ttl_minutes: 60,
        }
    }

    fn test_user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "alice".into(),
            email: "a@x.com".into(),
            password_hash: "hash".into(),
            full_name: "Alice Doe".into(),
            avatar_url: "".into(),
            cover_image_url: "".into(),
            refresh_token: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn sign_and_verify_access_token_carries_identity_claims() {
        let keys = JwtKeys::from_config(&test_config());
        let user = test_user();
        let token = keys.sign_access(&user).expect("sign access");
        let claims = keys.verify_access(&token).expect("verify access");
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.email, "a@x.com");
        assert_eq!(claims.full_name, "Alice Doe");
        assert_eq!(claims.iss, "test-issuer");
    }

    #[test]
    fn sign_and_verify_refresh_token() {
        let keys = JwtKeys::from_config(&test_config());
        let user_id = Uuid::new_v4();
        let token = keys.sign_refresh(user_id).expect("sign refresh");
        let claims = keys.verify_refresh(&token).expect("verify refresh");
        assert_eq!(claims.sub, user_id);
    }

    #[test]
    fn access_token_is_not_a_valid_refresh_token() {
        let keys = JwtKeys::from_config(&test_config());
        let token = keys.sign_access(&test_user()).expect("sign access");
        // Different secret per kind, so the signature check fails.
        assert!(matches!(
            keys.verify_refresh(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn refresh_token_is_not_a_valid_access_token() {
        let keys = JwtKeys::from_config(&test_config());
        let token = keys.sign_refresh(Uuid::new_v4()).expect("sign refresh");
        assert!(matches!(
            keys.verify_access(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn verify_rejects_token_signed_with_other_secret() {
        let keys = JwtKeys::from_config(&test_config());
        let mut other_cfg = test_config();
        other_cfg.access_secret = "completely-different".into();
        let other = JwtKeys::from_config(&other_cfg);
        let token = other.sign_access(&test_user()).expect("sign access");
        assert!(matches!(
            keys.verify_access(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn verify_rejects_expired_token() {
        let keys = JwtKeys::from_config(&test_config());
        let user = test_user();

        // Build a token whose exp is already outside the validation leeway.
        let now = OffsetDateTime::now_utc().unix_timestamp() as usize;
        let claims = AccessClaims {
            sub: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            iat: now - 600,
            exp: now - 300,
            iss: "test-issuer".into(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-access-secret"),
        )
        .expect("encode");
        assert!(matches!(
            keys.verify_access(&token),
            Err(AuthError::InvalidToken)
        ));
    }
}
