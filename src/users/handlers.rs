use axum::{
    extract::{FromRef, Multipart, State},
    http::StatusCode,
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::auth::extractors::CurrentUser;
use crate::auth::jwt::JwtKeys;
use crate::auth::password::{hash_password, verify_password};
use crate::error::{ApiError, ApiResult, AuthError};
use crate::state::AppState;
use crate::users::dto::{
    AuthResponse, ChangePasswordRequest, LoginRequest, PublicUser, RefreshRequest, TokenPair,
    UpdateProfileRequest,
};
use crate::users::repo_types::User;
use crate::users::service::{
    self, is_valid_email, issue_token_pair, register_user, upload_asset, RegistrationInput,
    UploadedFile,
};

const ACCESS_COOKIE: &str = "accessToken";
const REFRESH_COOKIE: &str = "refreshToken";

fn auth_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");
    cookie
}

fn removal_cookie(name: &'static str) -> Cookie<'static> {
    let mut cookie = Cookie::from(name);
    cookie.set_path("/");
    cookie
}

fn token_cookies(jar: CookieJar, access: &str, refresh: &str, secure: bool) -> CookieJar {
    jar.add(auth_cookie(ACCESS_COOKIE, access.to_string(), secure))
        .add(auth_cookie(REFRESH_COOKIE, refresh.to_string(), secure))
}

/// POST /register (multipart: fullName, userName, email, password, avatar
/// file required, coverImage file optional)
#[instrument(skip(state, mp))]
pub async fn register(
    State(state): State<AppState>,
    mut mp: Multipart,
) -> ApiResult<(StatusCode, Json<PublicUser>)> {
    let mut username = String::new();
    let mut email = String::new();
    let mut full_name = String::new();
    let mut password = String::new();
    let mut avatar: Option<UploadedFile> = None;
    let mut cover_image: Option<UploadedFile> = None;

    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("userName") => username = read_text(field).await?,
            Some("email") => email = read_text(field).await?,
            Some("fullName") => full_name = read_text(field).await?,
            Some("password") => password = read_text(field).await?,
            Some("avatar") => avatar = Some(read_file(field).await?),
            Some("coverImage") => cover_image = Some(read_file(field).await?),
            _ => {}
        }
    }

    let avatar = avatar.ok_or_else(|| ApiError::Validation("Avatar file is required".into()))?;
    let user = register_user(
        &state,
        RegistrationInput {
            username,
            email,
            full_name,
            password,
            avatar,
            cover_image,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(PublicUser::from(user))))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|e| ApiError::Validation(format!("Malformed multipart field: {}", e)))
}

async fn read_file(field: axum::extract::multipart::Field<'_>) -> ApiResult<UploadedFile> {
    let content_type = field
        .content_type()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "application/octet-stream".into());
    let bytes = field
        .bytes()
        .await
        .map_err(|e| ApiError::Validation(format!("Malformed multipart file: {}", e)))?;
    Ok(UploadedFile {
        bytes,
        content_type,
    })
}

/// POST /login. Unknown email and wrong password produce the same response.
#[instrument(skip(state, jar, payload))]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(mut payload): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<AuthResponse>)> {
    payload.email = payload.email.trim().to_lowercase();
    if payload.email.is_empty() {
        return Err(ApiError::Validation("Email is required".into()));
    }

    let user = User::find_by_email(&state.db, &payload.email)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| {
            warn!(email = %payload.email, "login with unknown email");
            ApiError::InvalidCredentials
        })?;

    let ok = verify_password(&payload.password, &user.password_hash)
        .map_err(ApiError::Internal)?;
    if !ok {
        warn!(user_id = %user.id, "login with wrong password");
        return Err(ApiError::InvalidCredentials);
    }

    let keys = JwtKeys::from_ref(&state);
    let (access, refresh) = issue_token_pair(&state.db, &keys, &user).await?;

    info!(user_id = %user.id, "user logged in");
    let jar = token_cookies(jar, &access, &refresh, state.config.cookie_secure);
    Ok((
        jar,
        Json(AuthResponse {
            user: PublicUser::from(user),
            access_token: access,
            refresh_token: refresh,
        }),
    ))
}

/// POST /refresh-token. Token comes from the cookie or the body; rotation
/// permanently invalidates the presented token.
#[instrument(skip(state, jar, payload))]
pub async fn refresh_token(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Option<Json<RefreshRequest>>,
) -> ApiResult<(CookieJar, Json<TokenPair>)> {
    let incoming = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .or_else(|| payload.and_then(|Json(p)| p.refresh_token))
        .ok_or_else(|| ApiError::Validation("Refresh token is required".into()))?;

    let keys = JwtKeys::from_ref(&state);
    let user = service::verify_refresh_for_rotation(&state.db, &keys, &incoming).await?;
    let (access, refresh) = issue_token_pair(&state.db, &keys, &user).await?;

    info!(user_id = %user.id, "refresh token rotated");
    let jar = token_cookies(jar, &access, &refresh, state.config.cookie_secure);
    Ok((
        jar,
        Json(TokenPair {
            access_token: access,
            refresh_token: refresh,
        }),
    ))
}

/// POST /logout. Clears the session slot and both cookies.
#[instrument(skip(state, jar, principal))]
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    CurrentUser(principal): CurrentUser,
) -> ApiResult<(CookieJar, Json<Value>)> {
    User::end_session(&state.db, principal.id)
        .await
        .map_err(ApiError::Internal)?;
    info!(user_id = %principal.id, "user logged out");
    let jar = jar
        .remove(removal_cookie(ACCESS_COOKIE))
        .remove(removal_cookie(REFRESH_COOKIE));
    Ok((jar, Json(json!({}))))
}

/// POST /change-password. The active session is left untouched, so an
/// outstanding refresh token survives a password change (see DESIGN.md).
#[instrument(skip(state, principal, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> ApiResult<Json<Value>> {
    let user = User::find_by_id(&state.db, principal.id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or(AuthError::PrincipalNotFound)?;

    let ok = verify_password(&payload.old_password, &user.password_hash)
        .map_err(ApiError::Internal)?;
    if !ok {
        warn!(user_id = %principal.id, email = %principal.email, "wrong current password");
        return Err(ApiError::InvalidCredentials);
    }
    if payload.new_password.len() < 8 {
        return Err(ApiError::Validation("Password too short".into()));
    }

    let hash = hash_password(&payload.new_password).map_err(ApiError::Internal)?;
    User::set_password_hash(&state.db, user.id, &hash)
        .await
        .map_err(ApiError::Internal)?;
    info!(user_id = %user.id, "password changed");
    Ok(Json(json!({})))
}

/// GET /current-user.
#[instrument(skip(state, principal))]
pub async fn current_user(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
) -> ApiResult<Json<PublicUser>> {
    let user = User::find_by_id(&state.db, principal.id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or(AuthError::PrincipalNotFound)?;
    Ok(Json(PublicUser::from(user)))
}

/// PATCH /update-account (fullName and/or email).
#[instrument(skip(state, principal, payload))]
pub async fn update_account(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> ApiResult<Json<PublicUser>> {
    let full_name = payload
        .full_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let email = payload
        .email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty());

    if full_name.is_none() && email.is_none() {
        return Err(ApiError::Validation("fullName or email is required".into()));
    }
    if let Some(email) = &email {
        if !is_valid_email(email) {
            return Err(ApiError::Validation("Invalid email".into()));
        }
    }

    let user = User::update_profile(&state.db, principal.id, full_name, email.as_deref()).await?;
    Ok(Json(PublicUser::from(user)))
}

/// PATCH /update-avatar (multipart, single `avatar` file).
#[instrument(skip(state, principal, mp))]
pub async fn update_avatar(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    mp: Multipart,
) -> ApiResult<Json<PublicUser>> {
    let file = single_file(mp, "avatar").await?;
    let asset = upload_asset(state.storage.as_ref(), &principal.username, "avatar", &file).await?;
    let user = User::set_avatar_url(&state.db, principal.id, &asset.url)
        .await
        .map_err(ApiError::Internal)?;
    info!(user_id = %user.id, url = %asset.url, "avatar updated");
    Ok(Json(PublicUser::from(user)))
}

/// PATCH /update-cover-image (multipart, single `coverImage` file).
#[instrument(skip(state, principal, mp))]
pub async fn update_cover_image(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    mp: Multipart,
) -> ApiResult<Json<PublicUser>> {
    let file = single_file(mp, "coverImage").await?;
    let asset = upload_asset(state.storage.as_ref(), &principal.username, "cover", &file).await?;
    let user = User::set_cover_image_url(&state.db, principal.id, &asset.url)
        .await
        .map_err(ApiError::Internal)?;
    info!(user_id = %user.id, url = %asset.url, "cover image updated");
    Ok(Json(PublicUser::from(user)))
}

async fn single_file(mut mp: Multipart, field_name: &str) -> ApiResult<UploadedFile> {
    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() == Some(field_name) {
            return read_file(field).await;
        }
    }
    Err(ApiError::Validation(format!(
        "{} file is required",
        field_name
    )))
}
