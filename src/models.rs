use serde::{Deserialize, Serialize};

/// A point in degree space. `lat`/`lng` are used directly as planar
/// coordinates by the movement math.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lng: f64,
    pub name: Option<String>,
}

impl Waypoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng, name: None }
    }

    pub fn named(lat: f64, lng: f64, name: impl Into<String>) -> Self {
        Self {
            lat,
            lng,
            name: Some(name.into()),
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusRef {
    pub id: String,
    /// Last persisted position, if the bus has ever reported one.
    pub position: Option<Position>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRef {
    pub id: String,
    pub name: Option<String>,
}

/// A trip flagged `started`, joined with its bus and route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTrip {
    pub trip_id: String,
    pub bus: BusRef,
    pub route: RouteRef,
}
