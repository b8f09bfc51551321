use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
    pub verify_ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    /// Providers may only offer rides starting within this distance of their
    /// registered location.
    pub max_pickup_distance_km: f64,
    /// Search matches rides whose pickup and dropoff both fall within this
    /// radius of the query points.
    pub search_radius_km: f64,
    pub ride_sweep_interval_secs: u64,
    pub db_acquire_timeout_secs: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "ridepool".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "ridepool-users".into()),
            ttl_minutes: env_or("JWT_TTL_MINUTES", 60),
            refresh_ttl_minutes: env_or("JWT_REFRESH_TTL_MINUTES", 60 * 24 * 14),
            verify_ttl_minutes: env_or("JWT_VERIFY_TTL_MINUTES", 60 * 24),
        };
        Ok(Self {
            database_url,
            jwt,
            max_pickup_distance_km: env_or("MAX_PICKUP_DISTANCE_KM", 5.0),
            search_radius_km: env_or("SEARCH_RADIUS_KM", 10.0),
            ride_sweep_interval_secs: env_or("RIDE_SWEEP_INTERVAL_SECS", 300),
            db_acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", 5),
        })
    }
}
