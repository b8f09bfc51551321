use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use time::{macros::format_description, Date};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    auth::{dto::MessageResponse, jwt::AuthUser},
    error::ApiError,
    geo::LatLon,
    rides::{
        dto::{CreateRideRequest, SearchQuery, UserRidesResponse},
        service,
        store::Ride,
    },
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rides", post(create_ride))
        .route("/rides/search", get(search_rides))
        .route("/rides/mine", get(my_rides))
        .route("/rides/:id/book", post(book_seat))
        .route("/rides/:id/cancel-booking", post(cancel_booking))
        .route("/rides/:id/cancel", post(cancel_ride))
}

#[instrument(skip(state, payload))]
pub async fn create_ride(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CreateRideRequest>,
) -> Result<(StatusCode, Json<Ride>), ApiError> {
    let ride = service::create_ride(
        &state,
        user_id,
        payload.pickup,
        payload.dropoff,
        payload.departs_at,
        payload.price,
        payload.capacity,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(ride)))
}

#[instrument(skip(state))]
pub async fn search_rides(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<Ride>>, ApiError> {
    let format = format_description!("[year]-[month]-[day]");
    let day = Date::parse(&q.date, &format)
        .map_err(|_| ApiError::Validation("date must be YYYY-MM-DD".into()))?;
    let rides = service::search(
        &state,
        LatLon::new(q.pickup_lat, q.pickup_lon),
        LatLon::new(q.dropoff_lat, q.dropoff_lon),
        day,
    )
    .await?;
    Ok(Json(rides))
}

#[instrument(skip(state))]
pub async fn my_rides(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<UserRidesResponse>, ApiError> {
    let rides = service::list_for_user(&state, user_id).await?;
    Ok(Json(UserRidesResponse {
        offered: rides.offered,
        taken: rides.taken,
    }))
}

#[instrument(skip(state))]
pub async fn book_seat(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, ApiError> {
    service::book_seat(&state, ride_id, user_id).await?;
    Ok(Json(MessageResponse {
        message: "Ride booked successfully".into(),
    }))
}

#[instrument(skip(state))]
pub async fn cancel_booking(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, ApiError> {
    service::cancel_booking(&state, ride_id, user_id).await?;
    Ok(Json(MessageResponse {
        message: "Your booking has been cancelled".into(),
    }))
}

#[instrument(skip(state))]
pub async fn cancel_ride(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, ApiError> {
    service::cancel_ride(&state, ride_id, user_id).await?;
    Ok(Json(MessageResponse {
        message: "Your ride has been cancelled".into(),
    }))
}
