//! Booking state machine.
//!
//! The coordination core only sees [`ReplicaStore::apply`]; everything else in
//! here is the leader-side planning (validate a client write, decide driver and
//! fare, emit an [`Operation`]) and the read-only queries.
//!
//! All state sits behind one lock. Planning reads it, applying writes it, and
//! the node serialises plan+apply for writes so a driver is never handed out
//! twice.

use crate::config::FareConfig;
use crate::protocol::{Operation, RideStatus, UserType};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Whether an apply changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
}

/// Destination of replicated operations.
///
/// Implementations must be idempotent per natural key: re-applying an
/// operation that already took effect is a no-op.
pub trait ReplicaStore: Send + Sync {
    fn apply(&self, operation: &Operation) -> Applied;
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub username: String,
    #[serde(skip)]
    pub password_digest: String,
    pub user_type: UserType,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub rating: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ride {
    pub ride_id: String,
    pub rider_name: String,
    pub driver_name: Option<String>,
    pub pickup: String,
    pub destination: String,
    pub status: RideStatus,
    pub fare: f64,
    pub estimated_distance: f64,
    pub estimated_time: u32,
    pub version: u64,
}

#[derive(Debug, Clone, Default)]
struct DriverState {
    location: Option<String>,
    available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverView {
    pub username: String,
    pub name: Option<String>,
    pub location: String,
    pub rating: f64,
}

/// What the leader decided for a booking, echoed back to the rider.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub ride_id: String,
    pub estimated_fare: f64,
    pub driver_name: Option<String>,
    pub status: RideStatus,
    pub estimated_distance: f64,
    pub estimated_time: u32,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub riders: usize,
    pub drivers: usize,
    pub available_drivers: usize,
    pub rides_total: usize,
    pub rides_active: usize,
    pub rides_completed: usize,
    pub rides_cancelled: usize,
}

#[derive(Debug, Default)]
struct BookingState {
    users: BTreeMap<String, User>,
    rides: BTreeMap<String, Ride>,
    drivers: BTreeMap<String, DriverState>,
}

pub struct BookingStore {
    state: Mutex<BookingState>,
    fares: FareConfig,
}

pub fn password_digest(username: &str, password: &str) -> String {
    let mut h = Sha256::new();
    h.update(username.as_bytes());
    h.update(b":");
    h.update(password.as_bytes());
    h.finalize().iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Kilometres between two named places: 1..=29, stable per pair.
pub fn estimate_distance(pickup: &str, destination: &str) -> f64 {
    let weight = |s: &str| s.chars().map(|c| c as i64).sum::<i64>();
    (1 + (weight(pickup) - weight(destination)).abs() % 29) as f64
}

/// Minutes at 30 km/h plus five for pickup.
pub fn estimate_duration(distance_km: f64) -> u32 {
    (distance_km / 30.0 * 60.0 + 5.0).round() as u32
}

impl BookingStore {
    pub fn new(fares: FareConfig) -> Self {
        Self {
            state: Mutex::new(BookingState::default()),
            fares,
        }
    }

    pub fn fare(&self, distance_km: f64) -> f64 {
        let raw = (self.fares.base_fare + distance_km * self.fares.per_km_rate) * self.fares.surge_factor;
        (raw * 100.0).round() / 100.0
    }

    /// Demo accounts: riders alice and bob, drivers driver1 (Downtown) and
    /// driver2 (Airport), all with password `pass123`. Returns how many
    /// operations took effect.
    pub fn seed_sample_data(&self) -> usize {
        let user = |username: &str, user_type, name: &str, phone: &str| {
            Operation::RegisterUser(
                username.into(),
                password_digest(username, "pass123"),
                user_type,
                Some(name.into()),
                Some(format!("{username}@example.com")),
                Some(phone.into()),
            )
        };
        let ops = [
            user("alice", UserType::Rider, "Alice Johnson", "9876543210"),
            user("bob", UserType::Rider, "Bob Smith", "8765432109"),
            user("driver1", UserType::Driver, "Dave Driver", "7654321098"),
            user("driver2", UserType::Driver, "Sarah Driver", "6543210987"),
            Operation::SetDriverAvailable("driver1".into(), "Downtown".into(), true),
            Operation::SetDriverAvailable("driver2".into(), "Airport".into(), true),
        ];
        ops.iter().filter(|op| self.apply(op) == Applied::Changed).count()
    }

    // ── planning (leader side) ──────────────────────────────────────────────

    pub fn plan_registration(
        &self,
        username: &str,
        password: &str,
        user_type: UserType,
        name: Option<String>,
        email: Option<String>,
        phone: Option<String>,
    ) -> Result<Operation, String> {
        if username.trim().is_empty() {
            return Err("Username must not be empty".into());
        }
        if self.state.lock().users.contains_key(username) {
            return Err("Username already exists".into());
        }
        Ok(Operation::RegisterUser(
            username.to_string(),
            password_digest(username, password),
            user_type,
            name,
            email,
            phone,
        ))
    }

    pub fn plan_booking(
        &self,
        ride_id: String,
        rider: &str,
        pickup: &str,
        destination: &str,
    ) -> Result<(Operation, Quote), String> {
        let state = self.state.lock();
        let user = state.users.get(rider).ok_or("User not found")?;
        if user.user_type != UserType::Rider {
            return Err("Only riders can book cabs".into());
        }
        let driver = state
            .drivers
            .iter()
            .find(|(_, d)| d.available && d.location.is_some())
            .map(|(name, _)| name.clone());
        drop(state);

        let distance = estimate_distance(pickup, destination);
        let fare = self.fare(distance);
        let status = if driver.is_some() {
            RideStatus::Accepted
        } else {
            RideStatus::Requested
        };
        let quote = Quote {
            ride_id: ride_id.clone(),
            estimated_fare: fare,
            driver_name: driver.clone(),
            status,
            estimated_distance: distance,
            estimated_time: estimate_duration(distance),
        };
        let op = Operation::BookRide(
            ride_id,
            rider.to_string(),
            pickup.to_string(),
            destination.to_string(),
            fare,
            driver,
            status,
        );
        Ok((op, quote))
    }

    pub fn plan_cancellation(&self, ride_id: &str) -> Result<Operation, String> {
        let state = self.state.lock();
        let ride = state.rides.get(ride_id).ok_or("Ride not found")?;
        if ride.status.is_terminal() {
            return Err(format!("Cannot cancel a ride that is {}", status_label(ride.status)));
        }
        Ok(Operation::CancelRide(ride_id.to_string()))
    }

    pub fn plan_status_update(&self, ride_id: &str, next: RideStatus) -> Result<Operation, String> {
        let state = self.state.lock();
        let ride = state.rides.get(ride_id).ok_or("Ride not found")?;
        if !ride.status.can_transition_to(next) {
            return Err(format!(
                "Invalid status transition from {} to {}",
                status_label(ride.status),
                status_label(next)
            ));
        }
        Ok(Operation::UpdateRideStatus(ride_id.to_string(), next))
    }

    pub fn plan_driver_availability(
        &self,
        driver: &str,
        location: &str,
        available: bool,
    ) -> Result<Operation, String> {
        let state = self.state.lock();
        let user = state.users.get(driver).ok_or("Driver not found")?;
        if user.user_type != UserType::Driver {
            return Err("User is not a driver".into());
        }
        Ok(Operation::SetDriverAvailable(
            driver.to_string(),
            location.to_string(),
            available,
        ))
    }

    // ── queries ─────────────────────────────────────────────────────────────

    pub fn authenticate(&self, username: &str, password: &str) -> Result<User, String> {
        let state = self.state.lock();
        let user = state.users.get(username).ok_or("User not found")?;
        if user.password_digest != password_digest(username, password) {
            return Err("Invalid password".into());
        }
        Ok(user.clone())
    }

    pub fn user(&self, username: &str) -> Option<User> {
        self.state.lock().users.get(username).cloned()
    }

    pub fn ride(&self, ride_id: &str) -> Option<Ride> {
        self.state.lock().rides.get(ride_id).cloned()
    }

    pub fn driver_location(&self, driver: &str) -> Option<String> {
        self.state.lock().drivers.get(driver).and_then(|d| d.location.clone())
    }

    pub fn is_driver_available(&self, driver: &str) -> bool {
        self.state.lock().drivers.get(driver).map_or(false, |d| d.available)
    }

    pub fn available_drivers(&self) -> Vec<DriverView> {
        let state = self.state.lock();
        state
            .drivers
            .iter()
            .filter(|(_, d)| d.available)
            .filter_map(|(name, d)| {
                let user = state.users.get(name)?;
                Some(DriverView {
                    username: name.clone(),
                    name: user.name.clone(),
                    location: d.location.clone()?,
                    rating: user.rating,
                })
            })
            .collect()
    }

    pub fn active_rides(&self) -> Vec<Ride> {
        self.state
            .lock()
            .rides
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn user_rides(&self, username: &str) -> Vec<Ride> {
        self.state
            .lock()
            .rides
            .values()
            .filter(|r| r.rider_name == username || r.driver_name.as_deref() == Some(username))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        let count_users = |t: UserType| state.users.values().filter(|u| u.user_type == t).count();
        let count_rides = |s: RideStatus| state.rides.values().filter(|r| r.status == s).count();
        StoreStats {
            riders: count_users(UserType::Rider),
            drivers: count_users(UserType::Driver),
            available_drivers: state.drivers.values().filter(|d| d.available).count(),
            rides_total: state.rides.len(),
            rides_active: state.rides.values().filter(|r| !r.status.is_terminal()).count(),
            rides_completed: count_rides(RideStatus::Completed),
            rides_cancelled: count_rides(RideStatus::Cancelled),
        }
    }

    fn release_driver(state: &mut BookingState, driver: Option<&str>) {
        if let Some(d) = driver.and_then(|name| state.drivers.get_mut(name)) {
            d.available = true;
        }
    }
}

impl ReplicaStore for BookingStore {
    fn apply(&self, operation: &Operation) -> Applied {
        let mut state = self.state.lock();
        match operation {
            Operation::RegisterUser(username, digest, user_type, name, email, phone) => {
                if state.users.contains_key(username) {
                    return Applied::Unchanged;
                }
                state.users.insert(
                    username.clone(),
                    User {
                        username: username.clone(),
                        password_digest: digest.clone(),
                        user_type: *user_type,
                        name: name.clone(),
                        email: email.clone(),
                        phone: phone.clone(),
                        rating: 5.0,
                    },
                );
                if *user_type == UserType::Driver {
                    state.drivers.entry(username.clone()).or_default();
                }
                Applied::Changed
            }

            Operation::BookRide(ride_id, rider, pickup, destination, fare, driver, status) => {
                if state.rides.contains_key(ride_id) {
                    return Applied::Unchanged;
                }
                let distance = estimate_distance(pickup, destination);
                state.rides.insert(
                    ride_id.clone(),
                    Ride {
                        ride_id: ride_id.clone(),
                        rider_name: rider.clone(),
                        driver_name: driver.clone(),
                        pickup: pickup.clone(),
                        destination: destination.clone(),
                        status: *status,
                        fare: *fare,
                        estimated_distance: distance,
                        estimated_time: estimate_duration(distance),
                        version: 0,
                    },
                );
                if let Some(d) = driver.as_deref().and_then(|name| state.drivers.get_mut(name)) {
                    d.available = false;
                }
                Applied::Changed
            }

            Operation::CancelRide(ride_id) => {
                let Some(ride) = state.rides.get_mut(ride_id) else {
                    return Applied::Unchanged;
                };
                if ride.status.is_terminal() {
                    return Applied::Unchanged;
                }
                ride.status = RideStatus::Cancelled;
                ride.version += 1;
                let driver = ride.driver_name.clone();
                Self::release_driver(&mut state, driver.as_deref());
                Applied::Changed
            }

            Operation::UpdateRideStatus(ride_id, next) => {
                let Some(ride) = state.rides.get_mut(ride_id) else {
                    return Applied::Unchanged;
                };
                if !ride.status.can_transition_to(*next) {
                    return Applied::Unchanged;
                }
                ride.status = *next;
                ride.version += 1;
                if next.is_terminal() {
                    let driver = ride.driver_name.clone();
                    Self::release_driver(&mut state, driver.as_deref());
                }
                Applied::Changed
            }

            Operation::SetDriverAvailable(driver, location, available) => {
                let is_driver = state
                    .users
                    .get(driver)
                    .map_or(false, |u| u.user_type == UserType::Driver);
                if !is_driver {
                    return Applied::Unchanged;
                }
                let entry = state.drivers.entry(driver.clone()).or_default();
                if entry.available == *available && entry.location.as_deref() == Some(location.as_str()) {
                    return Applied::Unchanged;
                }
                entry.available = *available;
                entry.location = Some(location.clone());
                Applied::Changed
            }
        }
    }
}

fn status_label(status: RideStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{status:?}"))
}
