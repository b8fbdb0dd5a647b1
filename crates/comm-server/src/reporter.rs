use mesh_wire::Alias;
use tracing::info;

/// One peer's worth of data in a periodic snapshot. A sink-only view:
/// nothing that reads this can mutate comm-server state.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub alias: Alias,
    pub role: mesh_wire::Role,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub peers: Vec<PeerSnapshot>,
}

/// External hook driven on a fixed period with a read-only view of the
/// peer registry. Implementations must not block for long, since the
/// central task computes the snapshot synchronously before handing it
/// off here.
pub trait Reporter: Send + Sync {
    fn report(&self, snapshot: &Snapshot);
}

/// Default reporter: logs peer and subscription counts at `info`. Good
/// enough when nothing external is consuming the snapshot.
#[derive(Default)]
pub struct LoggingReporter;

impl Reporter for LoggingReporter {
    fn report(&self, snapshot: &Snapshot) {
        let topic_count: usize = snapshot.peers.iter().map(|p| p.topics.len()).sum();
        info!(
            peers = snapshot.peers.len(),
            subscriptions = topic_count,
            "periodic report"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingReporter(Arc<Mutex<Vec<usize>>>);

    impl Reporter for RecordingReporter {
        fn report(&self, snapshot: &Snapshot) {
            self.0.lock().unwrap().push(snapshot.peers.len());
        }
    }

    #[test]
    fn reporter_receives_peer_count() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let reporter = RecordingReporter(Arc::clone(&calls));
        reporter.report(&Snapshot {
            peers: vec![PeerSnapshot {
                alias: 1,
                role: mesh_wire::Role::Client,
                topics: vec!["a".to_string()],
            }],
        });
        assert_eq!(*calls.lock().unwrap(), vec![1]);
    }
}
