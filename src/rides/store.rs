use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{error::ApiError, geo::Location};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Active,
    Cancelled,
}

impl FromStr for RideStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(RideStatus::Active),
            "cancelled" => Ok(RideStatus::Cancelled),
            other => anyhow::bail!("unknown ride status {other:?}"),
        }
    }
}

/// Canonical ride shape. All producers and consumers use this one structure;
/// the seat tuple (capacity, seats_remaining, passengers) is mutated only
/// through the store's conditional operations.
#[derive(Debug, Clone, Serialize)]
pub struct Ride {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub pickup: Location,
    pub dropoff: Location,
    #[serde(with = "time::serde::rfc3339")]
    pub departs_at: OffsetDateTime,
    pub price: f64,
    pub capacity: i32,
    pub seats_remaining: i32,
    pub status: RideStatus,
    pub passengers: Vec<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewRide {
    pub provider_id: Uuid,
    pub pickup: Location,
    pub dropoff: Location,
    pub departs_at: OffsetDateTime,
    pub price: f64,
    pub capacity: i32,
}

/// Authoritative ride inventory. Every seat mutation is a single atomic
/// conditional operation scoped to one ride id; `Ok(false)` from the `try_*`
/// operations means a precondition did not hold at commit time, and the
/// caller diagnoses against a fresh read.
#[async_trait]
pub trait RideStore: Send + Sync {
    async fn insert(&self, new: NewRide) -> Result<Ride, ApiError>;
    async fn get(&self, id: Uuid) -> Result<Option<Ride>, ApiError>;
    /// Active rides departing on `day` with at least one free seat.
    async fn search_day(&self, day: Date) -> Result<Vec<Ride>, ApiError>;
    async fn list_offered(&self, user_id: Uuid) -> Result<Vec<Ride>, ApiError>;
    async fn list_taken(&self, user_id: Uuid) -> Result<Vec<Ride>, ApiError>;
    /// Takes one seat for `passenger` iff the ride is active, has a free
    /// seat, is not the passenger's own, and the passenger holds no seat yet.
    async fn try_book(&self, ride_id: Uuid, passenger: Uuid) -> Result<bool, ApiError>;
    /// Releases `passenger`'s seat iff the ride is active and the seat is held.
    async fn try_cancel_booking(&self, ride_id: Uuid, passenger: Uuid) -> Result<bool, ApiError>;
    /// Flips an active ride to cancelled iff `provider` owns it.
    async fn try_cancel_ride(&self, ride_id: Uuid, provider: Uuid) -> Result<bool, ApiError>;
    /// Cancels every active ride whose departure is in the past.
    async fn sweep_expired(&self, now: OffsetDateTime) -> Result<u64, ApiError>;
}

#[derive(Debug, FromRow)]
struct RideRow {
    id: Uuid,
    provider_id: Uuid,
    pickup_address: String,
    pickup_lat: f64,
    pickup_lon: f64,
    dropoff_address: String,
    dropoff_lat: f64,
    dropoff_lon: f64,
    departs_at: OffsetDateTime,
    price: f64,
    capacity: i32,
    seats_remaining: i32,
    status: String,
    created_at: OffsetDateTime,
    passengers: Vec<Uuid>,
}

impl TryFrom<RideRow> for Ride {
    type Error = ApiError;

    fn try_from(row: RideRow) -> Result<Self, Self::Error> {
        let status = RideStatus::from_str(&row.status).map_err(ApiError::Internal)?;
        Ok(Ride {
            id: row.id,
            provider_id: row.provider_id,
            pickup: Location {
                address: row.pickup_address,
                lat: row.pickup_lat,
                lon: row.pickup_lon,
            },
            dropoff: Location {
                address: row.dropoff_address,
                lat: row.dropoff_lat,
                lon: row.dropoff_lon,
            },
            departs_at: row.departs_at,
            price: row.price,
            capacity: row.capacity,
            seats_remaining: row.seats_remaining,
            status,
            passengers: row.passengers,
            created_at: row.created_at,
        })
    }
}

// Shared SELECT head: one row per ride with its passenger ids aggregated.
const RIDE_SELECT: &str = r#"
    SELECT r.id, r.provider_id,
           r.pickup_address, r.pickup_lat, r.pickup_lon,
           r.dropoff_address, r.dropoff_lat, r.dropoff_lon,
           r.departs_at, r.price, r.capacity, r.seats_remaining,
           r.status, r.created_at,
           COALESCE(
               array_agg(p.passenger_id) FILTER (WHERE p.passenger_id IS NOT NULL),
               '{}'
           ) AS passengers
    FROM rides r
    LEFT JOIN ride_passengers p ON p.ride_id = r.id
"#;

pub struct PgRideStore {
    pool: PgPool,
}

impl PgRideStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_for_user(&self, tail: &str, user_id: Uuid) -> Result<Vec<Ride>, ApiError> {
        let sql = format!("{RIDE_SELECT} {tail}");
        let rows = sqlx::query_as::<_, RideRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Ride::try_from).collect()
    }
}

#[async_trait]
impl RideStore for PgRideStore {
    async fn insert(&self, new: NewRide) -> Result<Ride, ApiError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO rides (
                id, provider_id,
                pickup_address, pickup_lat, pickup_lon,
                dropoff_address, dropoff_lat, dropoff_lon,
                departs_at, price, capacity, seats_remaining
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
            "#,
        )
        .bind(id)
        .bind(new.provider_id)
        .bind(&new.pickup.address)
        .bind(new.pickup.lat)
        .bind(new.pickup.lon)
        .bind(&new.dropoff.address)
        .bind(new.dropoff.lat)
        .bind(new.dropoff.lon)
        .bind(new.departs_at)
        .bind(new.price)
        .bind(new.capacity)
        .execute(&self.pool)
        .await?;

        self.get(id)
            .await?
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("inserted ride {id} not readable")))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Ride>, ApiError> {
        let sql = format!("{RIDE_SELECT} WHERE r.id = $1 GROUP BY r.id");
        let row = sqlx::query_as::<_, RideRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Ride::try_from).transpose()
    }

    async fn search_day(&self, day: Date) -> Result<Vec<Ride>, ApiError> {
        let sql = format!(
            r#"{RIDE_SELECT}
            WHERE r.status = 'active' AND r.seats_remaining > 0 AND DATE(r.departs_at) = $1
            GROUP BY r.id
            ORDER BY r.departs_at ASC, r.price ASC
            "#
        );
        let rows = sqlx::query_as::<_, RideRow>(&sql)
            .bind(day)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Ride::try_from).collect()
    }

    async fn list_offered(&self, user_id: Uuid) -> Result<Vec<Ride>, ApiError> {
        self.fetch_for_user(
            "WHERE r.provider_id = $1 GROUP BY r.id ORDER BY r.departs_at DESC",
            user_id,
        )
        .await
    }

    async fn list_taken(&self, user_id: Uuid) -> Result<Vec<Ride>, ApiError> {
        self.fetch_for_user(
            r#"
            WHERE r.id IN (SELECT ride_id FROM ride_passengers WHERE passenger_id = $1)
            GROUP BY r.id
            ORDER BY r.departs_at DESC
            "#,
            user_id,
        )
        .await
    }

    async fn try_book(&self, ride_id: Uuid, passenger: Uuid) -> Result<bool, ApiError> {
        // One statement: the seat decrement and the passenger row commit (or
        // fail) together, so no interleaving can oversell. The composite
        // primary key on ride_passengers backstops a duplicate under race.
        let result = sqlx::query(
            r#"
            WITH seat AS (
                UPDATE rides
                SET seats_remaining = seats_remaining - 1
                WHERE id = $1
                  AND status = 'active'
                  AND seats_remaining > 0
                  AND provider_id <> $2
                  AND NOT EXISTS (
                      SELECT 1 FROM ride_passengers
                      WHERE ride_id = $1 AND passenger_id = $2
                  )
                RETURNING id
            )
            INSERT INTO ride_passengers (ride_id, passenger_id)
            SELECT id, $2 FROM seat
            "#,
        )
        .bind(ride_id)
        .bind(passenger)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                ApiError::Conflict("you have already booked this ride".into())
            }
            _ => ApiError::from(e),
        })?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_cancel_booking(&self, ride_id: Uuid, passenger: Uuid) -> Result<bool, ApiError> {
        let result = sqlx::query(
            r#"
            WITH removed AS (
                DELETE FROM ride_passengers
                USING rides
                WHERE ride_passengers.ride_id = $1
                  AND ride_passengers.passenger_id = $2
                  AND rides.id = ride_passengers.ride_id
                  AND rides.status = 'active'
                RETURNING ride_passengers.ride_id
            )
            UPDATE rides
            SET seats_remaining = seats_remaining + 1
            WHERE id IN (SELECT ride_id FROM removed)
            "#,
        )
        .bind(ride_id)
        .bind(passenger)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_cancel_ride(&self, ride_id: Uuid, provider: Uuid) -> Result<bool, ApiError> {
        let result = sqlx::query(
            r#"
            UPDATE rides
            SET status = 'cancelled'
            WHERE id = $1 AND provider_id = $2 AND status = 'active'
            "#,
        )
        .bind(ride_id)
        .bind(provider)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn sweep_expired(&self, now: OffsetDateTime) -> Result<u64, ApiError> {
        let result =
            sqlx::query("UPDATE rides SET status = 'cancelled' WHERE status = 'active' AND departs_at < $1")
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

/// In-memory inventory backing `AppState::fake()` and tests. One mutex guards
/// the map, so each `try_*` operation commits as a unit, matching the
/// single-statement guarantees of the Postgres store.
#[derive(Default)]
pub struct MemoryRideStore {
    rides: Mutex<HashMap<Uuid, Ride>>,
}

#[async_trait]
impl RideStore for MemoryRideStore {
    async fn insert(&self, new: NewRide) -> Result<Ride, ApiError> {
        let ride = Ride {
            id: Uuid::new_v4(),
            provider_id: new.provider_id,
            pickup: new.pickup,
            dropoff: new.dropoff,
            departs_at: new.departs_at,
            price: new.price,
            capacity: new.capacity,
            seats_remaining: new.capacity,
            status: RideStatus::Active,
            passengers: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.rides.lock().await.insert(ride.id, ride.clone());
        Ok(ride)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Ride>, ApiError> {
        Ok(self.rides.lock().await.get(&id).cloned())
    }

    async fn search_day(&self, day: Date) -> Result<Vec<Ride>, ApiError> {
        let rides = self.rides.lock().await;
        let mut found: Vec<Ride> = rides
            .values()
            .filter(|r| {
                r.status == RideStatus::Active
                    && r.seats_remaining > 0
                    && r.departs_at.date() == day
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.departs_at
                .cmp(&b.departs_at)
                .then(a.price.total_cmp(&b.price))
        });
        Ok(found)
    }

    async fn list_offered(&self, user_id: Uuid) -> Result<Vec<Ride>, ApiError> {
        let rides = self.rides.lock().await;
        let mut found: Vec<Ride> = rides
            .values()
            .filter(|r| r.provider_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.departs_at.cmp(&a.departs_at));
        Ok(found)
    }

    async fn list_taken(&self, user_id: Uuid) -> Result<Vec<Ride>, ApiError> {
        let rides = self.rides.lock().await;
        let mut found: Vec<Ride> = rides
            .values()
            .filter(|r| r.passengers.contains(&user_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.departs_at.cmp(&a.departs_at));
        Ok(found)
    }

    async fn try_book(&self, ride_id: Uuid, passenger: Uuid) -> Result<bool, ApiError> {
        let mut rides = self.rides.lock().await;
        let Some(ride) = rides.get_mut(&ride_id) else {
            return Ok(false);
        };
        if ride.status != RideStatus::Active
            || ride.seats_remaining == 0
            || ride.provider_id == passenger
            || ride.passengers.contains(&passenger)
        {
            return Ok(false);
        }
        ride.seats_remaining -= 1;
        ride.passengers.push(passenger);
        Ok(true)
    }

    async fn try_cancel_booking(&self, ride_id: Uuid, passenger: Uuid) -> Result<bool, ApiError> {
        let mut rides = self.rides.lock().await;
        let Some(ride) = rides.get_mut(&ride_id) else {
            return Ok(false);
        };
        if ride.status != RideStatus::Active {
            return Ok(false);
        }
        let Some(pos) = ride.passengers.iter().position(|p| *p == passenger) else {
            return Ok(false);
        };
        ride.passengers.remove(pos);
        ride.seats_remaining += 1;
        Ok(true)
    }

    async fn try_cancel_ride(&self, ride_id: Uuid, provider: Uuid) -> Result<bool, ApiError> {
        let mut rides = self.rides.lock().await;
        let Some(ride) = rides.get_mut(&ride_id) else {
            return Ok(false);
        };
        if ride.provider_id != provider || ride.status != RideStatus::Active {
            return Ok(false);
        }
        ride.status = RideStatus::Cancelled;
        Ok(true)
    }

    async fn sweep_expired(&self, now: OffsetDateTime) -> Result<u64, ApiError> {
        let mut rides = self.rides.lock().await;
        let mut count = 0;
        for ride in rides.values_mut() {
            if ride.status == RideStatus::Active && ride.departs_at < now {
                ride.status = RideStatus::Cancelled;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn place(name: &str, lat: f64, lon: f64) -> Location {
        Location {
            address: name.into(),
            lat,
            lon,
        }
    }

    fn new_ride(provider: Uuid, capacity: i32, departs_in: Duration) -> NewRide {
        NewRide {
            provider_id: provider,
            pickup: place("pickup", 29.65, -82.32),
            dropoff: place("dropoff", 28.54, -81.38),
            departs_at: OffsetDateTime::now_utc() + departs_in,
            price: 20.0,
            capacity,
        }
    }

    fn assert_seat_invariant(ride: &Ride) {
        assert_eq!(
            ride.seats_remaining + ride.passengers.len() as i32,
            ride.capacity,
            "seat invariant broken for ride {}",
            ride.id
        );
    }

    #[tokio::test]
    async fn booking_decrements_and_appends_as_one_unit() {
        let store = MemoryRideStore::default();
        let ride = store
            .insert(new_ride(Uuid::new_v4(), 2, Duration::hours(4)))
            .await
            .unwrap();
        let passenger = Uuid::new_v4();

        assert!(store.try_book(ride.id, passenger).await.unwrap());
        let ride = store.get(ride.id).await.unwrap().unwrap();
        assert_eq!(ride.seats_remaining, 1);
        assert_eq!(ride.passengers, vec![passenger]);
        assert_seat_invariant(&ride);
    }

    #[tokio::test]
    async fn preconditions_reject_without_mutating() {
        let store = MemoryRideStore::default();
        let provider = Uuid::new_v4();
        let ride = store
            .insert(new_ride(provider, 1, Duration::hours(4)))
            .await
            .unwrap();
        let passenger = Uuid::new_v4();

        // Own ride.
        assert!(!store.try_book(ride.id, provider).await.unwrap());
        // Unknown ride.
        assert!(!store.try_book(Uuid::new_v4(), passenger).await.unwrap());
        // Duplicate seat.
        assert!(store.try_book(ride.id, passenger).await.unwrap());
        assert!(!store.try_book(ride.id, passenger).await.unwrap());
        // Full ride.
        assert!(!store.try_book(ride.id, Uuid::new_v4()).await.unwrap());

        let ride = store.get(ride.id).await.unwrap().unwrap();
        assert_eq!(ride.seats_remaining, 0);
        assert_seat_invariant(&ride);
    }

    #[tokio::test]
    async fn concurrent_bookings_never_oversell() {
        let store = std::sync::Arc::new(MemoryRideStore::default());
        let ride = store
            .insert(new_ride(Uuid::new_v4(), 3, Duration::hours(4)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let ride_id = ride.id;
            handles.push(tokio::spawn(async move {
                store.try_book(ride_id, Uuid::new_v4()).await.unwrap()
            }));
        }
        let mut booked = 0;
        for handle in handles {
            if handle.await.unwrap() {
                booked += 1;
            }
        }
        assert_eq!(booked, 3);

        let ride = store.get(ride.id).await.unwrap().unwrap();
        assert_eq!(ride.seats_remaining, 0);
        assert_eq!(ride.passengers.len(), 3);
        assert_seat_invariant(&ride);
    }

    #[tokio::test]
    async fn cancel_booking_restores_exactly_once() {
        let store = MemoryRideStore::default();
        let ride = store
            .insert(new_ride(Uuid::new_v4(), 1, Duration::hours(4)))
            .await
            .unwrap();
        let passenger = Uuid::new_v4();

        assert!(store.try_book(ride.id, passenger).await.unwrap());
        assert!(store.try_cancel_booking(ride.id, passenger).await.unwrap());
        assert!(!store.try_cancel_booking(ride.id, passenger).await.unwrap());

        let ride = store.get(ride.id).await.unwrap().unwrap();
        assert_eq!(ride.seats_remaining, 1);
        assert!(ride.passengers.is_empty());
        assert_seat_invariant(&ride);
    }

    #[tokio::test]
    async fn provider_cancel_is_terminal_and_keeps_history() {
        let store = MemoryRideStore::default();
        let provider = Uuid::new_v4();
        let ride = store
            .insert(new_ride(provider, 2, Duration::hours(4)))
            .await
            .unwrap();
        let passenger = Uuid::new_v4();
        assert!(store.try_book(ride.id, passenger).await.unwrap());

        // Wrong actor, then the provider.
        assert!(!store.try_cancel_ride(ride.id, passenger).await.unwrap());
        assert!(store.try_cancel_ride(ride.id, provider).await.unwrap());
        assert!(!store.try_cancel_ride(ride.id, provider).await.unwrap());

        let ride = store.get(ride.id).await.unwrap().unwrap();
        assert_eq!(ride.status, RideStatus::Cancelled);
        // Reservations are void but the record is retained for display.
        assert_eq!(ride.passengers, vec![passenger]);
        assert!(!store.try_book(ride.id, Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn search_day_filters_and_orders() {
        let store = MemoryRideStore::default();
        let provider = Uuid::new_v4();
        let base = OffsetDateTime::now_utc() + Duration::days(2);
        let day = base.date();

        let mut late = new_ride(provider, 2, Duration::days(2));
        late.departs_at = base + Duration::hours(3);
        late.price = 5.0;
        let mut early_cheap = new_ride(provider, 2, Duration::days(2));
        early_cheap.departs_at = base;
        early_cheap.price = 10.0;
        let mut early_pricey = new_ride(provider, 2, Duration::days(2));
        early_pricey.departs_at = base;
        early_pricey.price = 30.0;
        let other_day = new_ride(provider, 2, Duration::days(5));

        let late = store.insert(late).await.unwrap();
        let early_cheap = store.insert(early_cheap).await.unwrap();
        let early_pricey = store.insert(early_pricey).await.unwrap();
        store.insert(other_day).await.unwrap();

        // A full ride on the same day must not surface.
        let mut full = new_ride(provider, 1, Duration::days(2));
        full.departs_at = base + Duration::hours(1);
        let full = store.insert(full).await.unwrap();
        assert!(store.try_book(full.id, Uuid::new_v4()).await.unwrap());

        let found = store.search_day(day).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early_cheap.id, early_pricey.id, late.id]);
    }

    #[tokio::test]
    async fn list_partitions_offered_and_taken() {
        let store = MemoryRideStore::default();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let offered = store
            .insert(new_ride(alice, 2, Duration::hours(4)))
            .await
            .unwrap();
        let taken = store
            .insert(new_ride(bob, 2, Duration::hours(6)))
            .await
            .unwrap();
        assert!(store.try_book(taken.id, alice).await.unwrap());

        let offered_list = store.list_offered(alice).await.unwrap();
        assert_eq!(offered_list.len(), 1);
        assert_eq!(offered_list[0].id, offered.id);

        let taken_list = store.list_taken(alice).await.unwrap();
        assert_eq!(taken_list.len(), 1);
        assert_eq!(taken_list[0].id, taken.id);
    }

    #[tokio::test]
    async fn sweep_cancels_only_past_active_rides() {
        let store = MemoryRideStore::default();
        let provider = Uuid::new_v4();
        let past = store
            .insert(new_ride(provider, 2, Duration::hours(-3)))
            .await
            .unwrap();
        let future = store
            .insert(new_ride(provider, 2, Duration::hours(3)))
            .await
            .unwrap();

        let count = store.sweep_expired(OffsetDateTime::now_utc()).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            store.get(past.id).await.unwrap().unwrap().status,
            RideStatus::Cancelled
        );
        assert_eq!(
            store.get(future.id).await.unwrap().unwrap().status,
            RideStatus::Active
        );
        // Second sweep finds nothing.
        assert_eq!(
            store.sweep_expired(OffsetDateTime::now_utc()).await.unwrap(),
            0
        );
    }
}
