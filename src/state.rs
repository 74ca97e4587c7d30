use std::sync::Arc;

use crate::leg::Leg;
use crate::models::{ActiveTrip, Position, Waypoint};
use crate::motion::{self, Step};

/// Simulator-owned movement state of one active trip.
#[derive(Debug, Clone)]
pub struct TripSimulationState {
    pub trip_id: String,
    pub bus_id: String,
    pub route_id: String,
    waypoints: Arc<[Waypoint]>,
    leg: Leg,
    current: Position,
    target: Position,
    completed_rounds: u32,
}

impl TripSimulationState {
    /// Seed a trip at the first waypoint of its route. Returns `None` for a
    /// route without waypoints.
    pub fn new(trip: &ActiveTrip, waypoints: Arc<[Waypoint]>) -> Option<Self> {
        let start = waypoints.first()?.position();
        Some(Self {
            trip_id: trip.trip_id.clone(),
            bus_id: trip.bus.id.clone(),
            route_id: trip.route.id.clone(),
            waypoints,
            leg: Leg::default(),
            current: start,
            target: start,
            completed_rounds: 0,
        })
    }

    /// Compute this tick's move without touching the state.
    pub fn plan_step(&self, speed: f64) -> Step {
        motion::step_toward(self.current, self.target, speed)
    }

    /// Apply a planned step once it has been persisted.
    pub fn commit(&mut self, step: Step) {
        self.current = step.position;
        if !step.reached {
            return;
        }

        let advance = self.leg.advance(self.waypoints.len());
        self.leg = advance.leg;
        if advance.round_completed {
            self.completed_rounds += 1;
        }
        if let Some(next) = self.waypoints.get(self.leg.index()) {
            self.target = next.position();
        }
    }

    pub fn leg(&self) -> Leg {
        self.leg
    }

    pub fn current(&self) -> Position {
        self.current
    }

    pub fn target(&self) -> Position {
        self.target
    }

    pub fn completed_rounds(&self) -> u32 {
        self.completed_rounds
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn target_name(&self) -> Option<&str> {
        self.waypoints
            .get(self.leg.index())
            .and_then(|w| w.name.as_deref())
    }
}
