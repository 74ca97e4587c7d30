//! Lifecycle owner of the simulator: starts it, drives the fixed-interval
//! ticker, and stops it when shutdown is requested.

use std::future::Future;

use tokio::signal;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::simulator::{Simulator, StatusSnapshot};
use crate::store::TripStore;

pub struct Runner<S> {
    simulator: Simulator<S>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl<S: TripStore> Runner<S> {
    pub fn new(simulator: Simulator<S>) -> Self {
        let (status_tx, _) = watch::channel(simulator.status());
        Self {
            simulator,
            status_tx,
        }
    }

    /// Status snapshots, refreshed after every cycle.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn simulator(&self) -> &Simulator<S> {
        &self.simulator
    }

    /// Run until `shutdown` resolves, then stop the simulator and hand it
    /// back. Cycles run one after another in this task, so a slow cycle
    /// delays the next tick rather than overlapping it.
    pub async fn run<F>(mut self, shutdown: F) -> Simulator<S>
    where
        F: Future<Output = ()>,
    {
        self.simulator.start().await;
        self.publish();

        let mut ticker = time::interval(self.simulator.settings().interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // first tick is immediate; start() already ran that cycle
        ticker.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.simulator.run_cycle().await;
                    self.publish();
                }
            }
        }

        self.simulator.stop();
        self.publish();
        info!("Simulator stopped");
        self.simulator
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.simulator.status());
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SimulationSettings;
    use crate::memory::MemoryStore;
    use crate::models::{ActiveTrip, Position, Waypoint};

    fn runner() -> Runner<MemoryStore> {
        let store = MemoryStore::new();
        store.insert_route("R", vec![Waypoint::new(0.0, 0.0), Waypoint::new(0.0, 0.01)]);
        store.insert_trip("t1", "b1", "R", true);
        Runner::new(Simulator::new(store, SimulationSettings::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_the_interval_until_shutdown() {
        let sim = runner().run(time::sleep(Duration::from_millis(12_000))).await;

        // t=0 (start), t=5s, t=10s
        assert_eq!(sim.store().write_count(), 3);
        assert_eq!(sim.status().cycles, 3);
        assert!(!sim.status().is_running);
        assert_eq!(sim.status().active_trips, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_status_snapshots() {
        let runner = runner();
        let rx = runner.subscribe();
        assert!(!rx.borrow().is_running);

        runner.run(time::sleep(Duration::from_millis(6_000))).await;
        let last = rx.borrow().clone();
        assert!(!last.is_running);
        assert_eq!(last.cycles, 2);
        assert_eq!(last.active_trips, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_shutdown_still_runs_first_cycle() {
        let sim = runner().run(async {}).await;
        assert_eq!(sim.store().write_count(), 1);
        assert_eq!(sim.store().bus_position("b1"), Some(Position::new(0.0, 0.0)));
    }

    struct PanickingStore;

    impl TripStore for PanickingStore {
        async fn fetch_active_trips(&self) -> Vec<ActiveTrip> {
            panic!("store exploded");
        }

        async fn fetch_route_waypoints(&self, _route_id: &str) -> Vec<Waypoint> {
            Vec::new()
        }

        async fn write_bus_position(&self, _bus_id: &str, _position: Position) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_cycle_does_not_stop_the_schedule() {
        let runner = Runner::new(Simulator::new(PanickingStore, SimulationSettings::default()));
        let rx = runner.subscribe();

        let sim = runner.run(time::sleep(Duration::from_millis(11_000))).await;
        assert_eq!(sim.status().cycles, 0);
        assert!(!rx.borrow().is_running);
    }
}
