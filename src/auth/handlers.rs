use axum::{
    extract::{FromRef, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthResponse, LoginRequest, MessageResponse, PublicUser, RefreshRequest,
            SignupRequest, UpdateProfileRequest, VerifyEmailQuery,
        },
        jwt::{AuthUser, JwtKeys, TokenKind},
        password::{hash_password, verify_password},
        store::{NewUser, ProfileUpdate},
    },
    error::ApiError,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/verify-email", get(verify_email))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/me", get(get_me).put(update_me))
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn validate_location(location: &Option<crate::geo::Location>) -> Result<(), ApiError> {
    if let Some(loc) = location {
        if loc.address.trim().is_empty() {
            return Err(ApiError::Validation("location address is empty".into()));
        }
        if !loc.coords().is_valid() {
            return Err(ApiError::Validation("location coordinates out of range".into()));
        }
    }
    Ok(())
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    Json(mut payload): Json<SignupRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    payload.email = payload.email.trim().to_lowercase();
    payload.username = payload.username.trim().to_string();

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(ApiError::Validation("invalid email".into()));
    }
    if payload.username.len() < 3 {
        return Err(ApiError::Validation("username too short".into()));
    }
    if payload.password.len() < 8 {
        return Err(ApiError::Validation("password too short".into()));
    }
    validate_location(&payload.location)?;

    if state
        .users
        .find_by_email_or_username(&payload.email, &payload.username)
        .await?
        .is_some()
    {
        warn!(email = %payload.email, "email or username already registered");
        return Err(ApiError::Conflict("email or username already exists".into()));
    }

    let hash = hash_password(&payload.password)?;
    let user = state
        .users
        .create(NewUser {
            email: payload.email,
            username: payload.username,
            password_hash: hash,
            location: payload.location,
        })
        .await?;

    let keys = JwtKeys::from_ref(&state);
    let token = keys.sign_verify(user.id)?;
    // Mail failure must not fail the signup; the link is recoverable.
    if let Err(e) = state.mailer.send_verification(&user.email, &token).await {
        warn!(error = %e, user_id = %user.id, "verification mail failed");
    }

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            message: "User created. Verify your email.".into(),
        }),
    ))
}

#[instrument(skip(state, query))]
pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<VerifyEmailQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    let keys = JwtKeys::from_ref(&state);
    let claims = keys
        .verify_kind(&query.token, TokenKind::Verify)
        .map_err(|_| ApiError::Unauthenticated("invalid or expired token".into()))?;

    if !state.users.mark_verified(claims.sub).await? {
        return Err(ApiError::NotFound("unknown user".into()));
    }

    info!(user_id = %claims.sub, "email verified");
    Ok(Json(MessageResponse {
        message: "Email verified successfully.".into(),
    }))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    payload.email = payload.email.trim().to_lowercase();

    let user = state
        .users
        .find_by_email(&payload.email)
        .await?
        .ok_or_else(|| {
            warn!(email = %payload.email, "login unknown email");
            ApiError::Unauthenticated("invalid credentials".into())
        })?;

    if !verify_password(&payload.password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::Unauthenticated("invalid credentials".into()));
    }

    if !user.verified {
        warn!(user_id = %user.id, "login before verification");
        return Err(ApiError::Unauthenticated(
            "verify your email before logging in".into(),
        ));
    }

    let keys = JwtKeys::from_ref(&state);
    let access_token = keys.sign_access(user.id)?;
    let refresh_token = keys.sign_refresh(user.id)?;

    info!(user_id = %user.id, "user logged in");
    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        user: user.into(),
    }))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let keys = JwtKeys::from_ref(&state);
    let claims = keys
        .verify_kind(&payload.refresh_token, TokenKind::Refresh)
        .map_err(|_| ApiError::Unauthenticated("invalid refresh token".into()))?;

    let user = state
        .users
        .find_by_id(claims.sub)
        .await?
        .ok_or_else(|| ApiError::Unauthenticated("unknown user".into()))?;

    let access_token = keys.sign_access(user.id)?;
    let refresh_token = keys.sign_refresh(user.id)?;

    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        user: user.into(),
    }))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PublicUser>, ApiError> {
    let user = state
        .users
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("unknown user".into()))?;
    Ok(Json(user.into()))
}

#[instrument(skip(state, payload))]
pub async fn update_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<PublicUser>, ApiError> {
    if let Some(username) = &payload.username {
        if username.trim().len() < 3 {
            return Err(ApiError::Validation("username too short".into()));
        }
    }
    validate_location(&payload.location)?;

    let user = state
        .users
        .update_profile(
            user_id,
            ProfileUpdate {
                username: payload.username.map(|u| u.trim().to_string()),
                location: payload.location,
            },
        )
        .await?
        .ok_or_else(|| ApiError::NotFound("unknown user".into()))?;

    info!(user_id = %user.id, "profile updated");
    Ok(Json(user.into()))
}
