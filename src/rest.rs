//! Trip store backed by the hosted database's REST interface
//! (PostgREST conventions: `apikey` header, `eq.` filters, embedded joins).

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{SimResult, SimulatorError};
use crate::models::{ActiveTrip, BusRef, Position, RouteRef, Waypoint};
use crate::store::TripStore;

const TRIP_SELECT: &str =
    "id,bus:buses(id,current_latitude,current_longitude),route:routes(id,name)";
const WAYPOINT_SELECT: &str = "latitude,longitude,name";

#[derive(Debug, Deserialize)]
struct TripRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    bus: Option<BusRow>,
    route: Option<RouteRow>,
}

#[derive(Debug, Deserialize)]
struct BusRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    current_latitude: Option<f64>,
    current_longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RouteRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaypointRow {
    latitude: f64,
    longitude: f64,
    name: Option<String>,
}

// Ids may be uuids or serial integers depending on the table
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

pub struct RestStore {
    client: Client,
    base_url: String,
    key: String,
    timeout: Duration,
}

impl RestStore {
    pub fn new(base_url: &str, key: &str, timeout: Duration) -> SimResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            timeout,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    fn active_trips_request(&self) -> RequestBuilder {
        self.authorized(self.client.get(self.table_url("trips")))
            .query(&[("select", TRIP_SELECT), ("started", "eq.true")])
    }

    fn waypoints_request(&self, route_id: &str) -> RequestBuilder {
        let route_filter = format!("eq.{}", route_id);
        self.authorized(self.client.get(self.table_url("route_waypoints")))
            .query(&[
                ("select", WAYPOINT_SELECT),
                ("route_id", route_filter.as_str()),
                ("order", "sequence.asc"),
            ])
    }

    fn position_request(&self, bus_id: &str, position: Position, now: DateTime<Utc>) -> RequestBuilder {
        let id_filter = format!("eq.{}", bus_id);
        self.authorized(self.client.patch(self.table_url("buses")))
            .query(&[("id", id_filter.as_str())])
            .header("Prefer", "return=minimal")
            .json(&position_update(position, now))
    }

    async fn send(&self, what: &'static str, request: RequestBuilder) -> SimResult<String> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SimulatorError::Timeout {
                    what,
                    millis: self.timeout.as_millis() as u64,
                }
            } else {
                SimulatorError::Http(e)
            }
        })?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SimulatorError::Status { what, status, body });
        }
        Ok(body)
    }

    pub async fn try_fetch_active_trips(&self) -> SimResult<Vec<ActiveTrip>> {
        let body = self.send("active trips fetch", self.active_trips_request()).await?;
        parse_trips(&body)
    }

    pub async fn try_fetch_route_waypoints(&self, route_id: &str) -> SimResult<Vec<Waypoint>> {
        let body = self
            .send("waypoint fetch", self.waypoints_request(route_id))
            .await?;
        parse_waypoints(&body)
    }

    pub async fn try_write_bus_position(&self, bus_id: &str, position: Position) -> SimResult<()> {
        self.send(
            "bus position update",
            self.position_request(bus_id, position, Utc::now()),
        )
        .await?;
        Ok(())
    }
}

impl TripStore for RestStore {
    async fn fetch_active_trips(&self) -> Vec<ActiveTrip> {
        match self.try_fetch_active_trips().await {
            Ok(trips) => trips,
            Err(e) => {
                warn!("Failed to fetch active trips: {}", e);
                Vec::new()
            }
        }
    }

    async fn fetch_route_waypoints(&self, route_id: &str) -> Vec<Waypoint> {
        match self.try_fetch_route_waypoints(route_id).await {
            Ok(waypoints) => waypoints,
            Err(e) => {
                warn!("Failed to fetch waypoints for route {}: {}", route_id, e);
                Vec::new()
            }
        }
    }

    async fn write_bus_position(&self, bus_id: &str, position: Position) -> bool {
        match self.try_write_bus_position(bus_id, position).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to update position for bus {}: {}", bus_id, e);
                false
            }
        }
    }
}

fn parse_trips(body: &str) -> SimResult<Vec<ActiveTrip>> {
    let rows: Vec<TripRow> = serde_json::from_str(body).map_err(|source| SimulatorError::Decode {
        what: "active trips",
        source,
    })?;

    let trips = rows
        .into_iter()
        .filter_map(|row| {
            let (Some(bus), Some(route)) = (row.bus, row.route) else {
                debug!("Trip {} has no bus or route joined, skipping", row.id);
                return None;
            };
            let position = match (bus.current_latitude, bus.current_longitude) {
                (Some(lat), Some(lng)) => Some(Position::new(lat, lng)),
                _ => None,
            };
            Some(ActiveTrip {
                trip_id: row.id,
                bus: BusRef {
                    id: bus.id,
                    position,
                },
                route: RouteRef {
                    id: route.id,
                    name: route.name,
                },
            })
        })
        .collect();
    Ok(trips)
}

fn parse_waypoints(body: &str) -> SimResult<Vec<Waypoint>> {
    let rows: Vec<WaypointRow> =
        serde_json::from_str(body).map_err(|source| SimulatorError::Decode {
            what: "route waypoints",
            source,
        })?;

    Ok(rows
        .into_iter()
        .map(|row| Waypoint {
            lat: row.latitude,
            lng: row.longitude,
            name: row.name,
        })
        .collect())
}

fn position_update(position: Position, now: DateTime<Utc>) -> serde_json::Value {
    json!({
        "current_latitude": position.lat,
        "current_longitude": position.lng,
        "last_location_update": now.to_rfc3339(),
    })
}
