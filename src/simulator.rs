//! The trip simulator: each cycle it reconciles the set of started trips,
//! then nudges every bus one step along its route and persists the result.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::SimulationSettings;
use crate::models::{ActiveTrip, Waypoint};
use crate::motion;
use crate::state::TripSimulationState;
use crate::store::TripStore;

/// Point-in-time view of the simulator, free of side effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub is_running: bool,
    pub active_trips: usize,
    pub cached_routes: usize,
    pub interval_ms: u64,
    pub movement_speed: f64,
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub initialized: usize,
    pub evicted: usize,
    pub moved: usize,
    pub failed: usize,
}

pub struct Simulator<S> {
    store: S,
    settings: SimulationSettings,
    running: bool,
    trips: HashMap<String, TripSimulationState>,
    waypoint_cache: HashMap<String, Arc<[Waypoint]>>,
    // consecutive cycles each cached trip has been missing from the fetch
    absences: HashMap<String, u32>,
    cycles: u64,
    last_cycle_at: Option<DateTime<Utc>>,
}

impl<S: TripStore> Simulator<S> {
    pub fn new(store: S, settings: SimulationSettings) -> Self {
        Self {
            store,
            settings,
            running: false,
            trips: HashMap::new(),
            waypoint_cache: HashMap::new(),
            absences: HashMap::new(),
            cycles: 0,
            last_cycle_at: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn trip_state(&self, trip_id: &str) -> Option<&TripSimulationState> {
        self.trips.get(trip_id)
    }

    /// Mark the simulator running and run the first cycle right away.
    /// Returns `false` (and does nothing else) if it was already running.
    pub async fn start(&mut self) -> bool {
        if self.running {
            warn!("Simulator is already running");
            return false;
        }

        self.running = true;
        info!(
            "Starting bus simulator (interval {} ms, speed {} deg/tick)",
            self.settings.interval.as_millis(),
            self.settings.movement_speed
        );
        self.run_cycle().await;
        true
    }

    /// Drop all in-memory state. Safe to call at any time.
    pub fn stop(&mut self) {
        if self.running {
            info!("Stopping bus simulator");
        }
        self.running = false;
        self.trips.clear();
        self.waypoint_cache.clear();
        self.absences.clear();
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            is_running: self.running,
            active_trips: self.trips.len(),
            cached_routes: self.waypoint_cache.len(),
            interval_ms: self.settings.interval.as_millis() as u64,
            movement_speed: self.settings.movement_speed,
            cycles: self.cycles,
            last_cycle_at: self.last_cycle_at,
        }
    }

    /// Run one cycle. A panic inside the cycle is logged and swallowed so the
    /// schedule keeps going.
    pub async fn run_cycle(&mut self) -> CycleReport {
        if !self.running {
            debug!("Simulator is stopped, skipping cycle");
            return CycleReport::default();
        }

        match AssertUnwindSafe(self.cycle()).catch_unwind().await {
            Ok(report) => report,
            Err(panic) => {
                error!("Simulation cycle failed: {}", panic_message(panic.as_ref()));
                CycleReport::default()
            }
        }
    }

    async fn cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let active = with_timeout(
            self.settings.request_timeout,
            "active trips fetch",
            self.store.fetch_active_trips(),
            Vec::new(),
        )
        .await;
        report.fetched = active.len();

        let active_ids: HashSet<&str> = active.iter().map(|t| t.trip_id.as_str()).collect();
        report.evicted = self.reconcile(&active_ids);

        for trip in &active {
            if self.trips.contains_key(&trip.trip_id) {
                continue;
            }
            if self.init_trip(trip).await {
                report.initialized += 1;
            }
        }

        let (moved, failed) = self.advance_trips(&active_ids).await;
        report.moved = moved;
        report.failed = failed;

        self.cycles += 1;
        self.last_cycle_at = Some(Utc::now());
        info!(
            "Simulation cycle complete: {} active trips ({} moved, {} failed)",
            self.trips.len(),
            report.moved,
            report.failed
        );
        report
    }

    // Evict cached trips that have been missing long enough. Returns how many.
    fn reconcile(&mut self, active_ids: &HashSet<&str>) -> usize {
        let threshold = self.settings.eviction_threshold.max(1);
        let mut evicted = Vec::new();

        for trip_id in self.trips.keys() {
            if active_ids.contains(trip_id.as_str()) {
                self.absences.remove(trip_id);
                continue;
            }
            let misses = self.absences.entry(trip_id.clone()).or_insert(0);
            *misses += 1;
            if *misses >= threshold {
                evicted.push(trip_id.clone());
            } else {
                debug!("Trip {} missing from active trips ({} of {})", trip_id, misses, threshold);
            }
        }

        for trip_id in &evicted {
            self.trips.remove(trip_id);
            self.absences.remove(trip_id);
            info!("Trip {} is no longer active, dropped its state", trip_id);
        }
        evicted.len()
    }

    async fn init_trip(&mut self, trip: &ActiveTrip) -> bool {
        let waypoints = self.route_waypoints(&trip.route.id).await;
        match TripSimulationState::new(trip, waypoints) {
            Some(state) => {
                info!(
                    "Tracking trip {} (bus {}) on route {} with {} waypoints",
                    trip.trip_id,
                    trip.bus.id,
                    trip.route.name.as_deref().unwrap_or(&trip.route.id),
                    state.waypoints().len()
                );
                self.trips.insert(trip.trip_id.clone(), state);
                true
            }
            None => {
                warn!(
                    "Route {} has no waypoints, trip {} will not move",
                    trip.route.id, trip.trip_id
                );
                false
            }
        }
    }

    // Cached per route id; empty results are not cached so they get refetched.
    async fn route_waypoints(&mut self, route_id: &str) -> Arc<[Waypoint]> {
        if let Some(waypoints) = self.waypoint_cache.get(route_id) {
            return Arc::clone(waypoints);
        }

        let fetched: Arc<[Waypoint]> = with_timeout(
            self.settings.request_timeout,
            "waypoint fetch",
            self.store.fetch_route_waypoints(route_id),
            Vec::new(),
        )
        .await
        .into();

        if !fetched.is_empty() {
            self.waypoint_cache
                .insert(route_id.to_string(), Arc::clone(&fetched));
        }
        fetched
    }

    // Step every active trip concurrently. Returns (moved, failed).
    async fn advance_trips(&mut self, active_ids: &HashSet<&str>) -> (usize, usize) {
        let speed = self.settings.movement_speed;
        let timeout = self.settings.request_timeout;
        let store = &self.store;

        let updates = self
            .trips
            .iter_mut()
            .filter(|(trip_id, _)| active_ids.contains(trip_id.as_str()))
            .map(move |(_, state)| async move {
                let step = state.plan_step(speed);
                let written = with_timeout(
                    timeout,
                    "bus position update",
                    store.write_bus_position(&state.bus_id, step.position),
                    false,
                )
                .await;
                if !written {
                    return false;
                }

                state.commit(step);
                debug!(
                    "Trip {} bus {} at ({:.6}, {:.6}), {:.3} km to {}{}",
                    state.trip_id,
                    state.bus_id,
                    state.current().lat,
                    state.current().lng,
                    motion::haversine_km(state.current(), state.target()),
                    state.target_name().unwrap_or("next waypoint"),
                    if state.leg().is_reversing() { " (return)" } else { "" }
                );
                true
            });

        let results = join_all(updates).await;
        let moved = results.iter().filter(|&&ok| ok).count();
        (moved, results.len() - moved)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown error")
}

async fn with_timeout<T, F>(limit: Duration, what: &str, call: F, fallback: T) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(value) => value,
        Err(_) => {
            warn!("{} timed out after {} ms", what, limit.as_millis());
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leg::Leg;
    use crate::memory::MemoryStore;
    use crate::models::Position;

    fn settings(eviction_threshold: u32) -> SimulationSettings {
        SimulationSettings {
            eviction_threshold,
            ..SimulationSettings::default()
        }
    }

    fn simulator(threshold: u32) -> Simulator<MemoryStore> {
        Simulator::new(MemoryStore::new(), settings(threshold))
    }

    fn two_point_route() -> Vec<Waypoint> {
        vec![Waypoint::new(0.0, 0.0), Waypoint::new(0.0, 0.002)]
    }

    #[tokio::test]
    async fn status_before_start_is_idle() {
        let sim = simulator(1);
        let status = sim.status();
        assert!(!status.is_running);
        assert_eq!(status.active_trips, 0);
        assert_eq!(status.cached_routes, 0);
        assert_eq!(status.interval_ms, 5000);
        assert_eq!(status.movement_speed, 0.001);
        assert_eq!(status.cycles, 0);
        assert!(status.last_cycle_at.is_none());
    }

    #[tokio::test]
    async fn start_runs_a_cycle_immediately() {
        let mut sim = simulator(1);
        sim.store().insert_route("R", two_point_route());
        sim.store().insert_trip("t1", "b1", "R", true);

        assert!(sim.start().await);
        let status = sim.status();
        assert!(status.is_running);
        assert_eq!(status.active_trips, 1);
        assert_eq!(status.cached_routes, 1);
        assert_eq!(status.cycles, 1);
        assert_eq!(sim.store().write_count(), 1);
        assert_eq!(sim.store().bus_position("b1"), Some(Position::new(0.0, 0.0)));
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let mut sim = simulator(1);
        sim.store().insert_route("R", two_point_route());
        sim.store().insert_trip("t1", "b1", "R", true);

        assert!(sim.start().await);
        assert!(!sim.start().await);
        assert_eq!(sim.status().cycles, 1);
        assert_eq!(sim.store().write_count(), 1);
    }

    #[tokio::test]
    async fn stop_clears_everything() {
        let mut sim = simulator(1);
        sim.store().insert_route("R", two_point_route());
        sim.store().insert_trip("t1", "b1", "R", true);
        sim.start().await;

        sim.stop();
        let status = sim.status();
        assert!(!status.is_running);
        assert_eq!(status.active_trips, 0);
        assert_eq!(status.cached_routes, 0);

        // stopping twice is fine, and stopped cycles do nothing
        sim.stop();
        assert_eq!(sim.run_cycle().await, CycleReport::default());
        assert_eq!(sim.store().write_count(), 1);
    }

    #[tokio::test]
    async fn two_waypoint_scenario_over_cycles() {
        let mut sim = simulator(1);
        sim.store().insert_route("R", two_point_route());
        sim.store().insert_trip("t1", "b1", "R", true);

        sim.start().await;
        assert_eq!(sim.trip_state("t1").unwrap().leg(), Leg::Forward(1));

        sim.run_cycle().await;
        let pos = sim.store().bus_position("b1").unwrap();
        assert_eq!(pos.lat, 0.0);
        assert!((pos.lng - 0.001).abs() < 1e-12);
        assert_eq!(sim.trip_state("t1").unwrap().leg(), Leg::Forward(1));

        sim.run_cycle().await;
        assert_eq!(sim.store().bus_position("b1"), Some(Position::new(0.0, 0.002)));
        let state = sim.trip_state("t1").unwrap();
        assert_eq!(state.leg(), Leg::Reverse(0));
        assert_eq!(state.target(), Position::new(0.0, 0.0));
    }

    #[tokio::test]
    async fn empty_route_never_gets_state_or_writes() {
        let mut sim = simulator(1);
        sim.store().insert_trip("t1", "b1", "nowhere", true);

        sim.start().await;
        sim.run_cycle().await;
        assert!(sim.trip_state("t1").is_none());
        assert_eq!(sim.status().active_trips, 0);
        assert_eq!(sim.status().cached_routes, 0);
        assert_eq!(sim.store().write_count(), 0);

        // waypoints appearing later are picked up
        sim.store().insert_route("nowhere", two_point_route());
        let report = sim.run_cycle().await;
        assert_eq!(report.initialized, 1);
        assert!(sim.trip_state("t1").is_some());
    }

    #[tokio::test]
    async fn waypoints_are_fetched_once_per_route() {
        let mut sim = simulator(1);
        sim.store().insert_route("R", two_point_route());
        sim.store().insert_trip("t1", "b1", "R", true);
        sim.start().await;

        sim.store().insert_trip("t2", "b2", "R", true);
        for _ in 0..3 {
            sim.run_cycle().await;
        }
        assert_eq!(sim.status().active_trips, 2);
        assert_eq!(sim.store().waypoint_fetch_count(), 1);
    }

    #[tokio::test]
    async fn ended_trip_is_dropped_before_next_update() {
        let mut sim = simulator(1);
        sim.store().insert_route("R", two_point_route());
        sim.store().insert_trip("t1", "b1", "R", true);
        sim.start().await;

        sim.store().set_started("t1", false);
        let report = sim.run_cycle().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(report.moved, 0);
        assert!(sim.trip_state("t1").is_none());
        assert_eq!(sim.store().write_count(), 1);
    }

    #[tokio::test]
    async fn eviction_waits_for_consecutive_absences() {
        let mut sim = simulator(2);
        sim.store().insert_route("R", two_point_route());
        sim.store().insert_trip("t1", "b1", "R", true);
        sim.start().await;

        // one flaky fetch: state survives and the bus holds still
        sim.store().set_fail_trip_fetch(true);
        let report = sim.run_cycle().await;
        assert_eq!(report.evicted, 0);
        assert_eq!(report.moved, 0);
        assert!(sim.trip_state("t1").is_some());

        // it comes back, continuing where it was
        sim.store().set_fail_trip_fetch(false);
        sim.run_cycle().await;
        let pos = sim.store().bus_position("b1").unwrap();
        assert!((pos.lng - 0.001).abs() < 1e-12);

        // two misses in a row evict
        sim.store().remove_trip("t1");
        sim.run_cycle().await;
        assert!(sim.trip_state("t1").is_some());
        let report = sim.run_cycle().await;
        assert_eq!(report.evicted, 1);
        assert!(sim.trip_state("t1").is_none());
    }

    #[tokio::test]
    async fn failed_write_keeps_the_step_for_next_tick() {
        let mut sim = simulator(1);
        sim.store().insert_route("R", two_point_route());
        sim.store().insert_trip("t1", "b1", "R", true);
        sim.start().await;

        sim.store().set_fail_writes(true);
        let report = sim.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(sim.trip_state("t1").unwrap().current(), Position::new(0.0, 0.0));

        sim.store().set_fail_writes(false);
        let report = sim.run_cycle().await;
        assert_eq!(report.moved, 1);
        assert!((sim.trip_state("t1").unwrap().current().lng - 0.001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn shuttles_back_and_forth_counting_rounds() {
        let mut sim = simulator(1);
        sim.store().insert_route(
            "R",
            vec![
                Waypoint::new(0.0, 0.0),
                Waypoint::new(0.0, 0.002),
                Waypoint::new(0.002, 0.002),
            ],
        );
        sim.store().insert_trip("t1", "b1", "R", true);
        sim.start().await;

        let mut indices = vec![sim.trip_state("t1").unwrap().leg()];
        while sim.trip_state("t1").unwrap().completed_rounds() < 1 {
            sim.run_cycle().await;
            let leg = sim.trip_state("t1").unwrap().leg();
            if indices.last() != Some(&leg) {
                indices.push(leg);
            }
        }

        assert_eq!(
            indices,
            vec![
                Leg::Forward(1),
                Leg::Forward(2),
                Leg::Reverse(1),
                Leg::Reverse(0),
                Leg::Forward(1),
            ]
        );
    }

    struct HangingStore(MemoryStore);

    impl TripStore for HangingStore {
        async fn fetch_active_trips(&self) -> Vec<ActiveTrip> {
            self.0.fetch_active_trips().await
        }

        async fn fetch_route_waypoints(&self, route_id: &str) -> Vec<Waypoint> {
            self.0.fetch_route_waypoints(route_id).await
        }

        async fn write_bus_position(&self, _bus_id: &str, _position: Position) -> bool {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_write_times_out_instead_of_stalling() {
        let store = MemoryStore::new();
        store.insert_route("R", two_point_route());
        store.insert_trip("t1", "b1", "R", true);
        let mut sim = Simulator::new(HangingStore(store), settings(1));

        sim.start().await;
        let report = sim.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(sim.status().active_trips, 1);
        assert_eq!(sim.trip_state("t1").unwrap().leg(), Leg::Forward(0));
    }
}
