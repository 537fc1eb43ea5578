use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionState};

/// Periodically sweeps all registered connections, closing the ones that have been idle
///  past their configured timeout and forgetting the ones that reached their terminal
///  state.
///
/// The registry lock is only held to snapshot the connection list; the actual idle
///  checks run without it so a sweep never blocks registration.
pub struct ConnectionMonitor {
    interval: Duration,
    connections: Mutex<FxHashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionMonitor {
    pub fn new(interval: Duration) -> Arc<ConnectionMonitor> {
        Arc::new(ConnectionMonitor {
            interval,
            connections: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn add(&self, connection: Arc<Connection>) {
        trace!("monitoring connection {}", connection.descriptor());
        self.connections.lock().unwrap().insert(connection.id(), connection);
    }

    pub fn remove(&self, connection_id: Uuid) {
        self.connections.lock().unwrap().remove(&connection_id);
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().unwrap().is_empty()
    }

    /// One sweep: idle-check every live connection, prune the closed ones.
    pub async fn check_now(&self) {
        let snapshot: Vec<Arc<Connection>> = {
            let connections = self.connections.lock().unwrap();
            connections.values().cloned().collect()
        };

        let mut finished = Vec::new();
        for connection in snapshot {
            if connection.state() == ConnectionState::Closed {
                finished.push(connection.id());
                continue;
            }
            connection.check_idle().await;
        }

        if !finished.is_empty() {
            debug!("pruning {} finished connections", finished.len());
            let mut connections = self.connections.lock().unwrap();
            for id in finished {
                connections.remove(&id);
            }
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.check_now().await;
            }
        })
    }
}
