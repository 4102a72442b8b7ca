use std::time::Duration;

use bytes::Bytes;
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::jwt::JwtKeys;
use crate::auth::password::hash_password;
use crate::error::{ApiError, ApiResult, AuthError};
use crate::state::AppState;
use crate::storage::{ObjectStore, StoredAsset};
use crate::users::repo::NewUser;
use crate::users::repo_types::User;

/// A hung upload must not block the request forever; expiry feeds the same
/// compensation path as a failed upload.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// An in-memory file received from a multipart request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub bytes: Bytes,
    pub content_type: String,
}

#[derive(Debug)]
pub struct RegistrationInput {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password: String,
    pub avatar: UploadedFile,
    pub cover_image: Option<UploadedFile>,
}

impl RegistrationInput {
    /// Trim and case-normalize the identity fields, then validate.
    fn normalized(mut self) -> ApiResult<Self> {
        self.username = self.username.trim().to_lowercase();
        self.email = self.email.trim().to_lowercase();
        self.full_name = self.full_name.trim().to_string();

        if self.username.is_empty()
            || self.email.is_empty()
            || self.full_name.is_empty()
            || self.password.trim().is_empty()
        {
            return Err(ApiError::Validation("All fields are required".into()));
        }
        if !is_valid_email(&self.email) {
            return Err(ApiError::Validation("Invalid email".into()));
        }
        if self.password.len() < 8 {
            return Err(ApiError::Validation("Password too short".into()));
        }
        Ok(self)
    }
}

/// Undo stack for the registration saga. Every successful upload pushes its
/// key; any later failure runs the stack. Once the database write lands the
/// stack is disarmed, because the assets are now referenced by a live row.
pub(crate) struct AssetRollback<'a> {
    storage: &'a dyn ObjectStore,
    keys: Vec<String>,
}

impl<'a> AssetRollback<'a> {
    pub(crate) fn new(storage: &'a dyn ObjectStore) -> Self {
        Self {
            storage,
            keys: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, key: String) {
        self.keys.push(key);
    }

    pub(crate) fn disarm(&mut self) {
        self.keys.clear();
    }

    /// Delete everything uploaded so far. A failed delete is logged and never
    /// masks the error that triggered the rollback.
    pub(crate) async fn run(self) {
        for key in self.keys {
            if let Err(e) = self.storage.delete(&key).await {
                warn!(error = %e, %key, "rollback delete failed, asset may be orphaned");
            }
        }
    }
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}

pub(crate) async fn upload_asset(
    storage: &dyn ObjectStore,
    username: &str,
    slot: &str,
    file: &UploadedFile,
) -> ApiResult<StoredAsset> {
    let ext = ext_from_mime(&file.content_type).unwrap_or("bin");
    let key = format!("users/{}/{}-{}.{}", username, slot, Uuid::new_v4(), ext);
    match tokio::time::timeout(
        UPLOAD_TIMEOUT,
        storage.upload(&key, file.bytes.clone(), &file.content_type),
    )
    .await
    {
        Ok(Ok(asset)) => Ok(asset),
        Ok(Err(e)) => {
            error!(error = %e, %key, "upload failed");
            Err(ApiError::Upload(format!("Failed to upload {}", slot)))
        }
        Err(_) => {
            error!(%key, "upload timed out");
            Err(ApiError::Upload(format!("Timed out uploading {}", slot)))
        }
    }
}

/// Avatar first, then cover, sequentially; the rollback stack always reflects
/// exactly what has been uploaded so far.
async fn upload_registration_assets<'a>(
    storage: &'a dyn ObjectStore,
    rollback: &mut AssetRollback<'a>,
    username: &str,
    avatar: &UploadedFile,
    cover_image: Option<&UploadedFile>,
) -> ApiResult<(StoredAsset, Option<StoredAsset>)> {
    let avatar_asset = upload_asset(storage, username, "avatar", avatar).await?;
    rollback.push(avatar_asset.key.clone());

    let cover_asset = match cover_image {
        Some(file) => {
            let asset = upload_asset(storage, username, "cover", file).await?;
            rollback.push(asset.key.clone());
            Some(asset)
        }
        None => None,
    };

    Ok((avatar_asset, cover_asset))
}

async fn persist_with_assets<'a>(
    state: &AppState,
    rollback: &mut AssetRollback<'a>,
    storage: &'a dyn ObjectStore,
    input: &RegistrationInput,
) -> ApiResult<User> {
    let (avatar, cover) = upload_registration_assets(
        storage,
        rollback,
        &input.username,
        &input.avatar,
        input.cover_image.as_ref(),
    )
    .await?;

    let password_hash = hash_password(&input.password).map_err(ApiError::Internal)?;
    let created = User::create(
        &state.db,
        NewUser {
            username: &input.username,
            email: &input.email,
            password_hash: &password_hash,
            full_name: &input.full_name,
            avatar_url: &avatar.url,
            cover_image_url: cover.as_ref().map(|a| a.url.as_str()).unwrap_or(""),
        },
    )
    .await?;

    // The write landed; from here on the assets belong to a live user and
    // must not be deleted even if the read-back fails.
    rollback.disarm();

    let user = User::find_by_id(&state.db, created.id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| {
            ApiError::Internal(anyhow::anyhow!("created user missing on read-back"))
        })?;
    Ok(user)
}

/// The registration saga: validate, check uniqueness, upload avatar and
/// optional cover, persist, read back. Any failure after the first upload
/// deletes every asset uploaded so far, so the outcome is either a fully
/// formed user with reachable assets or no user and no orphans.
pub async fn register_user(state: &AppState, input: RegistrationInput) -> ApiResult<User> {
    let input = input.normalized()?;

    if User::find_by_username_or_email(&state.db, &input.username, &input.email)
        .await
        .map_err(ApiError::Internal)?
        .is_some()
    {
        return Err(ApiError::Conflict(
            "User with that username or email already exists".into(),
        ));
    }

    let storage = state.storage.as_ref();
    let mut rollback = AssetRollback::new(storage);
    match persist_with_assets(state, &mut rollback, storage, &input).await {
        Ok(user) => {
            info!(user_id = %user.id, username = %user.username, "user registered");
            Ok(user)
        }
        Err(e) => {
            rollback.run().await;
            Err(e)
        }
    }
}

/// Sign a fresh access/refresh pair and overwrite the session slot in one
/// UPDATE. Login and rotation share this path.
pub async fn issue_token_pair(
    db: &PgPool,
    keys: &JwtKeys,
    user: &User,
) -> ApiResult<(String, String)> {
    let access = keys.sign_access(user).map_err(ApiError::Internal)?;
    let refresh = keys.sign_refresh(user.id).map_err(ApiError::Internal)?;
    User::start_session(db, user.id, &refresh)
        .await
        .map_err(ApiError::Internal)?;
    Ok((access, refresh))
}

/// Full refresh-token check: signature and expiry, a live principal, and an
/// exact match against the stored session slot. A rotated or logged-out
/// token fails the last check even while its signature is still valid.
pub async fn verify_refresh_for_rotation(
    db: &PgPool,
    keys: &JwtKeys,
    token: &str,
) -> ApiResult<User> {
    let claims = keys.verify_refresh(token)?;
    let user = User::find_by_id(db, claims.sub)
        .await
        .map_err(ApiError::Internal)?
        .ok_or(AuthError::PrincipalNotFound)?;
    if !user.session().matches(token) {
        return Err(AuthError::TokenMismatch.into());
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::async_trait;
    use std::sync::Mutex;

    /// Storage fake that records every call and can be told to fail from the
    /// nth upload onward.
    struct RecordingStore {
        fail_from_attempt: usize,
        attempts: Mutex<usize>,
        uploads: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
    }

    impl RecordingStore {
        fn new(fail_from_attempt: usize) -> Self {
            Self {
                fail_from_attempt,
                attempts: Mutex::new(0),
                uploads: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> usize {
            *self.attempts.lock().unwrap()
        }

        fn uploads(&self) -> Vec<String> {
            self.uploads.lock().unwrap().clone()
        }

        fn deletes(&self) -> Vec<String> {
            self.deletes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn upload(
            &self,
            key: &str,
            _body: Bytes,
            _content_type: &str,
        ) -> anyhow::Result<StoredAsset> {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            if *attempts >= self.fail_from_attempt {
                anyhow::bail!("simulated storage outage");
            }
            self.uploads.lock().unwrap().push(key.to_string());
            Ok(StoredAsset {
                key: key.to_string(),
                url: format!("https://cdn.test/{}", key),
            })
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.deletes.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    fn file(ct: &str) -> UploadedFile {
        UploadedFile {
            bytes: Bytes::from_static(b"fake image bytes"),
            content_type: ct.into(),
        }
    }

    fn input(cover: bool) -> RegistrationInput {
        RegistrationInput {
            username: "Alice ".into(),
            email: " A@X.com".into(),
            full_name: " Alice Doe ".into(),
            password: "longenough".into(),
            avatar: file("image/png"),
            cover_image: cover.then(|| file("image/jpeg")),
        }
    }

    #[test]
    fn normalization_trims_and_lowercases() {
        let normalized = input(false).normalized().expect("valid input");
        assert_eq!(normalized.username, "alice");
        assert_eq!(normalized.email, "a@x.com");
        assert_eq!(normalized.full_name, "Alice Doe");
    }

    #[test]
    fn validation_rejects_blank_fields() {
        let mut bad = input(false);
        bad.full_name = "   ".into();
        assert!(matches!(
            bad.normalized(),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_email_and_short_password() {
        let mut bad = input(false);
        bad.email = "not-an-email".into();
        assert!(matches!(bad.normalized(), Err(ApiError::Validation(_))));

        let mut short = input(false);
        short.password = "short".into();
        assert!(matches!(short.normalized(), Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn avatar_failure_uploads_nothing_and_skips_cover() {
        let store = RecordingStore::new(1);
        let mut rollback = AssetRollback::new(&store);
        let avatar = file("image/png");
        let cover = file("image/jpeg");

        let err = upload_registration_assets(&store, &mut rollback, "alice", &avatar, Some(&cover))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Upload(_)));
        // Only the avatar upload was ever attempted.
        assert_eq!(store.attempts(), 1);
        assert!(store.uploads().is_empty());

        rollback.run().await;
        assert!(store.deletes().is_empty());
    }

    #[tokio::test]
    async fn cover_failure_compensates_by_deleting_avatar() {
        let store = RecordingStore::new(2);
        let mut rollback = AssetRollback::new(&store);
        let avatar = file("image/png");
        let cover = file("image/jpeg");

        let err = upload_registration_assets(&store, &mut rollback, "alice", &avatar, Some(&cover))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Upload(_)));

        rollback.run().await;
        let uploads = store.uploads();
        assert_eq!(uploads.len(), 1);
        // Exactly one delete, for exactly the uploaded avatar key.
        assert_eq!(store.deletes(), uploads);
    }

    #[tokio::test]
    async fn persistence_failure_deletes_every_uploaded_asset_once() {
        let store = RecordingStore::new(usize::MAX);
        let mut rollback = AssetRollback::new(&store);
        let avatar = file("image/png");
        let cover = file("image/jpeg");

        let (a, c) = upload_registration_assets(&store, &mut rollback, "alice", &avatar, Some(&cover))
            .await
            .expect("uploads succeed");
        assert!(c.is_some());

        // The insert failed after both uploads landed.
        rollback.run().await;
        let deletes = store.deletes();
        assert_eq!(deletes.len(), 2);
        assert!(deletes.contains(&a.key));
        assert!(deletes.contains(&c.unwrap().key));
    }

    #[tokio::test]
    async fn disarmed_rollback_deletes_nothing() {
        let store = RecordingStore::new(usize::MAX);
        let mut rollback = AssetRollback::new(&store);
        let avatar = file("image/png");

        upload_registration_assets(&store, &mut rollback, "alice", &avatar, None)
            .await
            .expect("upload succeeds");
        rollback.disarm();
        rollback.run().await;
        assert!(store.deletes().is_empty());
    }

    #[tokio::test]
    async fn upload_keys_carry_extension_from_mime() {
        let store = RecordingStore::new(usize::MAX);
        let asset = upload_asset(&store, "alice", "avatar", &file("image/webp"))
            .await
            .expect("upload");
        assert!(asset.key.starts_with("users/alice/avatar-"));
        assert!(asset.key.ends_with(".webp"));
        assert!(asset.url.ends_with(&asset.key));
    }

    #[test]
    fn email_shape_check() {
        assert!(is_valid_email("a@x.com"));
        assert!(is_valid_email("first.last@sub.domain.io"));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("spaces in@x.com"));
        assert!(!is_valid_email("a@nodot"));
    }
}
