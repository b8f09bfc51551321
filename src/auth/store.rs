use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{error::ApiError, geo::Location};

/// User record. The password hash never leaves the server.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub verified: bool,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub created_at: OffsetDateTime,
}

impl User {
    /// The registered location, present only once address and coordinates
    /// have all been set.
    pub fn registered_location(&self) -> Option<Location> {
        match (&self.address, self.lat, self.lon) {
            (Some(address), Some(lat), Some(lon)) => Some(Location {
                address: address.clone(),
                lat,
                lon,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub location: Option<Location>,
}

/// Credential store: lookup by identity and upsert of user records.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, ApiError>;
    async fn find_by_email_or_username(
        &self,
        email: &str,
        username: &str,
    ) -> Result<Option<User>, ApiError>;
    async fn create(&self, new: NewUser) -> Result<User, ApiError>;
    /// Flips the verification flag. Returns false if the user is unknown.
    async fn mark_verified(&self, id: Uuid) -> Result<bool, ApiError>;
    async fn update_profile(
        &self,
        id: Uuid,
        update: ProfileUpdate,
    ) -> Result<Option<User>, ApiError>;
}

const USER_COLUMNS: &str =
    "id, email, username, password_hash, verified, address, lat, lon, created_at";

pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, ApiError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_email_or_username(
        &self,
        email: &str,
        username: &str,
    ) -> Result<Option<User>, ApiError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1 OR username = $2"
        ))
        .bind(email)
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create(&self, new: NewUser) -> Result<User, ApiError> {
        let (address, lat, lon) = match new.location {
            Some(loc) => (Some(loc.address), Some(loc.lat), Some(loc.lon)),
            None => (None, None, None),
        };
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, username, password_hash, address, lat, lon)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&new.email)
        .bind(&new.username)
        .bind(&new.password_hash)
        .bind(address)
        .bind(lat)
        .bind(lon)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            // Unique violation: a concurrent signup won the race.
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                ApiError::Conflict("email or username already exists".into())
            }
            _ => ApiError::from(e),
        })?;
        Ok(user)
    }

    async fn mark_verified(&self, id: Uuid) -> Result<bool, ApiError> {
        let result = sqlx::query("UPDATE users SET verified = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: ProfileUpdate,
    ) -> Result<Option<User>, ApiError> {
        let (address, lat, lon) = match update.location {
            Some(loc) => (Some(loc.address), Some(loc.lat), Some(loc.lon)),
            None => (None, None, None),
        };
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
            SET username = COALESCE($2, username),
                address  = COALESCE($3, address),
                lat      = COALESCE($4, lat),
                lon      = COALESCE($5, lon)
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.username)
        .bind(address)
        .bind(lat)
        .bind(lon)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }
}

/// In-memory credential store backing `AppState::fake()` and tests.
#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError> {
        Ok(self.users.lock().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, ApiError> {
        Ok(self
            .users
            .lock()
            .await
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_by_email_or_username(
        &self,
        email: &str,
        username: &str,
    ) -> Result<Option<User>, ApiError> {
        Ok(self
            .users
            .lock()
            .await
            .values()
            .find(|u| u.email == email || u.username == username)
            .cloned())
    }

    async fn create(&self, new: NewUser) -> Result<User, ApiError> {
        let mut users = self.users.lock().await;
        if users
            .values()
            .any(|u| u.email == new.email || u.username == new.username)
        {
            return Err(ApiError::Conflict("email or username already exists".into()));
        }
        let (address, lat, lon) = match new.location {
            Some(loc) => (Some(loc.address), Some(loc.lat), Some(loc.lon)),
            None => (None, None, None),
        };
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            username: new.username,
            password_hash: new.password_hash,
            verified: false,
            address,
            lat,
            lon,
            created_at: OffsetDateTime::now_utc(),
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn mark_verified(&self, id: Uuid) -> Result<bool, ApiError> {
        match self.users.lock().await.get_mut(&id) {
            Some(user) => {
                user.verified = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: ProfileUpdate,
    ) -> Result<Option<User>, ApiError> {
        let mut users = self.users.lock().await;
        let Some(user) = users.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(username) = update.username {
            user.username = username;
        }
        if let Some(loc) = update.location {
            user.address = Some(loc.address);
            user.lat = Some(loc.lat);
            user.lon = Some(loc.lon);
        }
        Ok(Some(user.clone()))
    }
}
