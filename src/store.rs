//! The data-access boundary of the simulator.

use crate::models::{ActiveTrip, Position, Waypoint};

/// Reads trips and waypoints, writes bus positions.
///
/// Implementations never fail outward: errors are logged and degrade to an
/// empty list or `false`, so one bad call cannot halt a cycle.
#[allow(async_fn_in_trait)]
pub trait TripStore {
    /// All trips currently flagged `started`, joined with bus and route.
    async fn fetch_active_trips(&self) -> Vec<ActiveTrip>;

    /// Ordered waypoints of a route, empty when it has none.
    async fn fetch_route_waypoints(&self, route_id: &str) -> Vec<Waypoint>;

    /// Persist a bus position (with a timestamp). Returns whether it stuck.
    async fn write_bus_position(&self, bus_id: &str, position: Position) -> bool;
}
