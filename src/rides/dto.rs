use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::geo::Location;
use crate::rides::store::Ride;

/// Request body for offering a ride.
#[derive(Debug, Deserialize)]
pub struct CreateRideRequest {
    pub pickup: Location,
    pub dropoff: Location,
    #[serde(with = "time::serde::rfc3339")]
    pub departs_at: OffsetDateTime,
    pub price: f64,
    pub capacity: i32,
}

/// Query string for ride search; `date` is a calendar day (`YYYY-MM-DD`).
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub pickup_lat: f64,
    pub pickup_lon: f64,
    pub dropoff_lat: f64,
    pub dropoff_lon: f64,
    pub date: String,
}

#[derive(Debug, Serialize)]
pub struct UserRidesResponse {
    pub offered: Vec<Ride>,
    pub taken: Vec<Ride>,
}
