use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database. One row per account; `refresh_token` is the
/// single session slot.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub full_name: String,
    pub avatar_url: String,
    pub cover_image_url: String,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User {
    pub fn session(&self) -> SessionSlot {
        SessionSlot(self.refresh_token.clone())
    }
}

/// The single stored refresh token for an account. Overwritten on each
/// login/rotation, cleared on logout; a presented refresh token is only valid
/// if it exactly matches the slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSlot(pub Option<String>);

impl SessionSlot {
    pub fn start(&mut self, refresh_token: String) {
        self.0 = Some(refresh_token);
    }

    /// Idempotent; ending an already-ended session is a no-op.
    pub fn end(&mut self) {
        self.0 = None;
    }

    pub fn is_active(&self) -> bool {
        self.0.is_some()
    }

    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_deref() == Some(presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_session_matches_its_token() {
        let mut slot = SessionSlot::default();
        assert!(!slot.is_active());
        slot.start("tok-1".into());
        assert!(slot.is_active());
        assert!(slot.matches("tok-1"));
        assert!(!slot.matches("tok-2"));
    }

    #[test]
    fn rotation_kills_the_previous_token() {
        let mut slot = SessionSlot::default();
        slot.start("tok-1".into());
        slot.start("tok-2".into());
        assert!(!slot.matches("tok-1"));
        assert!(slot.matches("tok-2"));
    }

    #[test]
    fn ended_session_matches_nothing_and_end_is_idempotent() {
        let mut slot = SessionSlot::default();
        slot.start("tok-1".into());
        slot.end();
        assert!(!slot.matches("tok-1"));
        slot.end();
        assert!(!slot.is_active());
    }
}
