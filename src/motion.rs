//! Movement math. Distances here are planar, taken directly on lat/lng
//! values, so a fixed step is a fixed angular distance per tick.

use crate::models::Position;

/// Result of moving one tick toward a target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub position: Position,
    pub reached: bool,
}

/// Euclidean distance in degree space.
pub fn degree_distance(from: Position, to: Position) -> f64 {
    let dlat = to.lat - from.lat;
    let dlng = to.lng - from.lng;
    (dlat * dlat + dlng * dlng).sqrt()
}

/// Move `speed` degrees from `current` toward `target`, snapping onto the
/// target once it is within reach.
pub fn step_toward(current: Position, target: Position, speed: f64) -> Step {
    let distance = degree_distance(current, target);
    if distance <= speed {
        return Step {
            position: target,
            reached: true,
        };
    }

    let ratio = speed / distance;
    Step {
        position: Position::new(
            current.lat + (target.lat - current.lat) * ratio,
            current.lng + (target.lng - current.lng) * ratio,
        ),
        reached: false,
    }
}

// Great-circle distance in km, only used for log output
pub fn haversine_km(from: Position, to: Position) -> f64 {
    let r = 6371.0; // Earth radius in km
    let dlat = (to.lat - from.lat).to_radians();
    let dlng = (to.lng - from.lng).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + from.lat.to_radians().cos() * to.lat.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    r * c
}
