use time::{Date, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::ApiError,
    geo::{LatLon, Location},
    rides::store::{NewRide, Ride, RideStatus},
    state::AppState,
};

/// How many times a conditional mutation is re-attempted when the diagnosis
/// read shows the precondition holding again (a seat freed mid-flight).
const MAX_BOOK_ATTEMPTS: u32 = 3;

/// Grace for "present" departure timestamps: request validation happens some
/// time after the client filled the form.
const DEPARTURE_GRACE_SECS: i64 = 60;

fn validate_place(label: &str, loc: &Location) -> Result<(), ApiError> {
    if loc.address.trim().is_empty() {
        return Err(ApiError::Validation(format!("{label} address is empty")));
    }
    if !loc.coords().is_valid() {
        return Err(ApiError::Validation(format!(
            "{label} coordinates out of range"
        )));
    }
    Ok(())
}

pub async fn create_ride(
    state: &AppState,
    provider_id: Uuid,
    pickup: Location,
    dropoff: Location,
    departs_at: OffsetDateTime,
    price: f64,
    capacity: i32,
) -> Result<Ride, ApiError> {
    if capacity < 1 {
        return Err(ApiError::Validation("capacity must be at least 1".into()));
    }
    if !price.is_finite() || price < 0.0 {
        return Err(ApiError::Validation("price must be non-negative".into()));
    }
    if departs_at < OffsetDateTime::now_utc() - time::Duration::seconds(DEPARTURE_GRACE_SECS) {
        return Err(ApiError::Validation("departure must not be in the past".into()));
    }
    validate_place("pickup", &pickup)?;
    validate_place("dropoff", &dropoff)?;

    let provider = state
        .users
        .find_by_id(provider_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("unknown user".into()))?;
    let home = provider.registered_location().ok_or_else(|| {
        ApiError::Validation("register a location before offering rides".into())
    })?;

    let distance = state.geocoder.distance_km(home.coords(), pickup.coords());
    if distance > state.config.max_pickup_distance_km {
        return Err(ApiError::Proximity(format!(
            "pickup is {distance:.1} km from your registered location (max {} km)",
            state.config.max_pickup_distance_km
        )));
    }

    let ride = state
        .rides
        .insert(NewRide {
            provider_id,
            pickup,
            dropoff,
            departs_at,
            price,
            capacity,
        })
        .await?;
    info!(ride_id = %ride.id, provider_id = %provider_id, "ride created");
    Ok(ride)
}

/// Active rides on `day` with free seats whose pickup and dropoff both fall
/// within the configured radius of the query points. Read-only; results may
/// be momentarily stale against concurrent bookings, which is why booking
/// re-validates.
pub async fn search(
    state: &AppState,
    pickup: LatLon,
    dropoff: LatLon,
    day: Date,
) -> Result<Vec<Ride>, ApiError> {
    if !pickup.is_valid() || !dropoff.is_valid() {
        return Err(ApiError::Validation("coordinates out of range".into()));
    }

    let radius = state.config.search_radius_km;
    let mut rides = state.rides.search_day(day).await?;
    rides.retain(|ride| {
        state.geocoder.distance_km(pickup, ride.pickup.coords()) <= radius
            && state.geocoder.distance_km(dropoff, ride.dropoff.coords()) <= radius
    });
    // The store orders by departure then price; retain keeps that order.
    Ok(rides)
}

pub struct UserRides {
    pub offered: Vec<Ride>,
    pub taken: Vec<Ride>,
}

pub async fn list_for_user(state: &AppState, user_id: Uuid) -> Result<UserRides, ApiError> {
    let offered = state.rides.list_offered(user_id).await?;
    let taken = state.rides.list_taken(user_id).await?;
    Ok(UserRides { offered, taken })
}

/// The core atomic operation: take one seat for `passenger`. The store
/// mutation is a single conditional commit; when it reports a failed
/// precondition, this diagnoses against a fresh read and maps the cause to
/// the error taxonomy, retrying only while the read shows a bookable ride.
pub async fn book_seat(state: &AppState, ride_id: Uuid, passenger: Uuid) -> Result<(), ApiError> {
    for _ in 0..MAX_BOOK_ATTEMPTS {
        if state.rides.try_book(ride_id, passenger).await? {
            info!(ride_id = %ride_id, passenger_id = %passenger, "seat booked");
            return Ok(());
        }

        let ride = state
            .rides
            .get(ride_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("ride not found".into()))?;
        if ride.status != RideStatus::Active {
            return Err(ApiError::Conflict("ride is not open for booking".into()));
        }
        if ride.provider_id == passenger {
            return Err(ApiError::Forbidden(
                "providers cannot book their own ride".into(),
            ));
        }
        if ride.passengers.contains(&passenger) {
            return Err(ApiError::Conflict("you have already booked this ride".into()));
        }
        if ride.seats_remaining == 0 {
            return Err(ApiError::Conflict("no seats available".into()));
        }
        // The read shows a bookable ride, so the conditional update lost a
        // race that has since resolved. Try again.
    }
    Err(ApiError::Unavailable(
        "ride is contended, retry the booking".into(),
    ))
}

pub async fn cancel_booking(
    state: &AppState,
    ride_id: Uuid,
    passenger: Uuid,
) -> Result<(), ApiError> {
    for _ in 0..MAX_BOOK_ATTEMPTS {
        if state.rides.try_cancel_booking(ride_id, passenger).await? {
            info!(ride_id = %ride_id, passenger_id = %passenger, "booking cancelled");
            return Ok(());
        }

        let ride = state
            .rides
            .get(ride_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("ride not found".into()))?;
        if ride.status != RideStatus::Active {
            return Err(ApiError::Conflict("ride is no longer active".into()));
        }
        if !ride.passengers.contains(&passenger) {
            return Err(ApiError::Conflict(
                "you have no booking on this ride".into(),
            ));
        }
    }
    Err(ApiError::Unavailable(
        "ride is contended, retry the cancellation".into(),
    ))
}

/// Provider cancellation: terminal status flip. Passenger reservations become
/// void going forward; their rows are retained for history.
pub async fn cancel_ride(state: &AppState, ride_id: Uuid, actor: Uuid) -> Result<(), ApiError> {
    if state.rides.try_cancel_ride(ride_id, actor).await? {
        info!(ride_id = %ride_id, provider_id = %actor, "ride cancelled by provider");
        return Ok(());
    }

    let ride = state
        .rides
        .get(ride_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("ride not found".into()))?;
    if ride.provider_id != actor {
        return Err(ApiError::Forbidden(
            "you are not the provider of this ride".into(),
        ));
    }
    Err(ApiError::Conflict("ride already cancelled".into()))
}

/// Periodically cancels active rides whose departure has passed.
pub fn spawn_expiry_sweeper(state: AppState) -> JoinHandle<()> {
    let period = std::time::Duration::from_secs(state.config.ride_sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.rides.sweep_expired(OffsetDateTime::now_utc()).await {
                Ok(0) => {}
                Ok(count) => info!(count, "cancelled expired rides"),
                Err(e) => warn!(error = %e, "expiry sweep failed"),
            }
        }
    })
}
