//! Trip simulator for the bus-tracking backend: moves every started trip's
//! bus along its route's waypoints and writes the positions back.

pub mod config;
pub mod error;
pub mod http;
pub mod leg;
pub mod memory;
pub mod models;
pub mod motion;
pub mod rest;
pub mod runner;
pub mod simulator;
pub mod state;
pub mod store;

pub use config::{Backend, SimulationSettings, SimulatorConfig};
pub use error::{SimResult, SimulatorError};
pub use leg::Leg;
pub use memory::MemoryStore;
pub use models::{ActiveTrip, BusRef, Position, RouteRef, Waypoint};
pub use rest::RestStore;
pub use runner::Runner;
pub use simulator::{CycleReport, Simulator, StatusSnapshot};
pub use state::TripSimulationState;
pub use store::TripStore;
