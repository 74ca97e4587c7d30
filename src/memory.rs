//! In-memory trip store, used for offline demos (seeded from CSV fixtures)
//! and as the store behind the simulator tests.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{SimResult, SimulatorError};
use crate::models::{ActiveTrip, BusRef, Position, RouteRef, Waypoint};
use crate::store::TripStore;

pub const TRIPS_FILE: &str = "trips.csv";
pub const WAYPOINTS_FILE: &str = "waypoints.csv";

#[derive(Debug, Deserialize)]
struct TripRecord {
    trip_id: String,
    bus_id: String,
    route_id: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    started: bool,
}

#[derive(Debug, Deserialize)]
struct WaypointRecord {
    route_id: String,
    sequence: u32,
    latitude: f64,
    longitude: f64,
    name: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredTrip {
    trip_id: String,
    bus_id: String,
    route_id: String,
    started: bool,
}

#[derive(Debug, Clone, Copy)]
struct StoredPosition {
    position: Position,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    trips: Vec<StoredTrip>,
    waypoints: HashMap<String, Vec<Waypoint>>,
    positions: HashMap<String, StoredPosition>,
    writes: usize,
    waypoint_fetches: usize,
    fail_writes: bool,
    fail_trip_fetch: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `trips.csv` and `waypoints.csv` from `dir`.
    pub fn from_fixture_dir(dir: &Path) -> SimResult<Self> {
        let store = Self::new();

        for record in read_records::<TripRecord>(dir, TRIPS_FILE)? {
            store.insert_trip(&record.trip_id, &record.bus_id, &record.route_id, record.started);
            if let (Some(lat), Some(lng)) = (record.latitude, record.longitude) {
                store.set_bus_position(&record.bus_id, Position::new(lat, lng));
            }
        }

        let mut by_route: HashMap<String, Vec<WaypointRecord>> = HashMap::new();
        for record in read_records::<WaypointRecord>(dir, WAYPOINTS_FILE)? {
            by_route.entry(record.route_id.clone()).or_default().push(record);
        }
        for (route_id, mut records) in by_route {
            records.sort_by_key(|r| r.sequence);
            let waypoints = records
                .into_iter()
                .map(|r| Waypoint {
                    lat: r.latitude,
                    lng: r.longitude,
                    name: r.name,
                })
                .collect();
            store.insert_route(&route_id, waypoints);
        }

        let inner = store.lock();
        info!(
            "Loaded fixtures from {}: {} trips, {} routes",
            dir.display(),
            inner.trips.len(),
            inner.waypoints.len()
        );
        drop(inner);
        Ok(store)
    }

    pub fn insert_route(&self, route_id: &str, waypoints: Vec<Waypoint>) {
        self.lock().waypoints.insert(route_id.to_string(), waypoints);
    }

    /// Add or replace a trip.
    pub fn insert_trip(&self, trip_id: &str, bus_id: &str, route_id: &str, started: bool) {
        let mut inner = self.lock();
        inner.trips.retain(|t| t.trip_id != trip_id);
        inner.trips.push(StoredTrip {
            trip_id: trip_id.to_string(),
            bus_id: bus_id.to_string(),
            route_id: route_id.to_string(),
            started,
        });
    }

    pub fn set_started(&self, trip_id: &str, started: bool) {
        if let Some(trip) = self.lock().trips.iter_mut().find(|t| t.trip_id == trip_id) {
            trip.started = started;
        }
    }

    pub fn remove_trip(&self, trip_id: &str) {
        self.lock().trips.retain(|t| t.trip_id != trip_id);
    }

    pub fn set_bus_position(&self, bus_id: &str, position: Position) {
        self.lock().positions.insert(
            bus_id.to_string(),
            StoredPosition {
                position,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn bus_position(&self, bus_id: &str) -> Option<Position> {
        self.lock().positions.get(bus_id).map(|p| p.position)
    }

    pub fn last_updated(&self, bus_id: &str) -> Option<DateTime<Utc>> {
        self.lock().positions.get(bus_id).map(|p| p.updated_at)
    }

    /// Number of successful position writes so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn waypoint_fetch_count(&self) -> usize {
        self.lock().waypoint_fetches
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn set_fail_trip_fetch(&self, fail: bool) {
        self.lock().fail_trip_fetch = fail;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // never held across an await, so poisoning only follows a panic elsewhere
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TripStore for MemoryStore {
    async fn fetch_active_trips(&self) -> Vec<ActiveTrip> {
        let inner = self.lock();
        if inner.fail_trip_fetch {
            warn!("Failed to fetch active trips: store unavailable");
            return Vec::new();
        }

        inner
            .trips
            .iter()
            .filter(|t| t.started)
            .map(|t| ActiveTrip {
                trip_id: t.trip_id.clone(),
                bus: BusRef {
                    id: t.bus_id.clone(),
                    position: inner.positions.get(&t.bus_id).map(|p| p.position),
                },
                route: RouteRef {
                    id: t.route_id.clone(),
                    name: None,
                },
            })
            .collect()
    }

    async fn fetch_route_waypoints(&self, route_id: &str) -> Vec<Waypoint> {
        let mut inner = self.lock();
        inner.waypoint_fetches += 1;
        inner.waypoints.get(route_id).cloned().unwrap_or_default()
    }

    async fn write_bus_position(&self, bus_id: &str, position: Position) -> bool {
        let mut inner = self.lock();
        if inner.fail_writes {
            warn!("Failed to update position for bus {}: store unavailable", bus_id);
            return false;
        }
        inner.writes += 1;
        inner.positions.insert(
            bus_id.to_string(),
            StoredPosition {
                position,
                updated_at: Utc::now(),
            },
        );
        true
    }
}

fn read_records<T>(dir: &Path, file_name: &str) -> SimResult<Vec<T>>
where
    T: for<'de> Deserialize<'de>,
{
    let path = dir.join(file_name);
    let file = File::open(&path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: T = result.map_err(|source| SimulatorError::Fixture {
            file: path.display().to_string(),
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}
