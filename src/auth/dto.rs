use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::Location;

/// Request body for signup.
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    /// Registered location; may also be set later via profile update.
    #[serde(default)]
    pub location: Option<Location>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Response returned after login or refresh.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: PublicUser,
}

/// Public part of the user returned to clients.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub verified: bool,
    pub location: Option<Location>,
}

impl From<crate::auth::store::User> for PublicUser {
    fn from(user: crate::auth::store::User) -> Self {
        let location = user.registered_location();
        Self {
            id: user.id,
            email: user.email,
            username: user.username,
            verified: user.verified,
            location,
        }
    }
}

/// Request body for profile updates; absent fields are left untouched.
#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
}
