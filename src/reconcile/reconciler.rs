//! The reconciliation loop.
//!
//! Events from providers update the per-source fragment table. After a
//! quiet period the table is merged, a snapshot is built and, if anything
//! changed, published.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant};

use crate::dynamic::merge;
use crate::dynamic::types::{EntityError, TopologyEvent, TopologyFragment};
use crate::observability::records::ReconcileRecord;
use crate::reconcile::snapshot::{BuildContext, RoutingSnapshot, SnapshotHandle};

#[derive(Debug, thiserror::Error)]
#[error("reconciler is no longer running")]
pub struct PublishError;

/// Provider-side handle for publishing topology events.
#[derive(Debug, Clone)]
pub struct TopologyPublisher {
    tx: mpsc::UnboundedSender<TopologyEvent>,
}

impl TopologyPublisher {
    /// Replace everything `source` declared with `fragment`.
    pub fn replace(&self, source: &str, fragment: TopologyFragment) -> Result<(), PublishError> {
        self.send(TopologyEvent::Replaced {
            source: source.to_string(),
            fragment,
        })
    }

    /// Withdraw every entity `source` declared.
    pub fn remove(&self, source: &str) -> Result<(), PublishError> {
        self.send(TopologyEvent::Removed {
            source: source.to_string(),
        })
    }

    pub fn send(&self, event: TopologyEvent) -> Result<(), PublishError> {
        self.tx.send(event).map_err(|_| PublishError)
    }
}

/// Create a publisher and the receiving end the reconciler consumes.
pub fn topology_channel() -> (TopologyPublisher, mpsc::UnboundedReceiver<TopologyEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TopologyPublisher { tx }, rx)
}

pub struct Reconciler {
    fragments: BTreeMap<String, TopologyFragment>,
    snapshots: SnapshotHandle,
    ctx: BuildContext,
    debounce: Duration,
    /// Canonical form of what the current snapshot was built from.
    last_input: Option<(Vec<u8>, Vec<EntityError>)>,
}

impl Reconciler {
    pub fn new(snapshots: SnapshotHandle, ctx: BuildContext, debounce: Duration) -> Self {
        Self {
            fragments: BTreeMap::new(),
            snapshots,
            ctx,
            debounce,
            last_input: None,
        }
    }

    pub fn snapshots(&self) -> &SnapshotHandle {
        &self.snapshots
    }

    pub fn sources(&self) -> impl Iterator<Item = &String> {
        self.fragments.keys()
    }

    /// Record an event in the fragment table. Does not publish.
    pub fn apply(&mut self, event: TopologyEvent) {
        match event {
            TopologyEvent::Replaced { source, fragment } => {
                tracing::debug!(source = %source, routers = fragment.routers.len(), "Fragment replaced");
                self.fragments.insert(source, fragment);
            }
            TopologyEvent::Removed { source } => {
                tracing::debug!(source = %source, "Fragment removed");
                self.fragments.remove(&source);
            }
        }
    }

    /// Merge the current fragments and publish a new snapshot if the
    /// result differs from the one currently served.
    pub fn reconcile(&mut self) -> ReconcileRecord {
        let outcome = merge(&self.fragments);
        let input = (outcome.config.canonical_bytes(), outcome.errors.clone());

        if self.last_input.as_ref() == Some(&input) {
            let current = self.snapshots.load();
            return ReconcileRecord {
                generation: current.generation,
                routers: current.routes.len(),
                services: current.pools.len(),
                targets: current.pools.target_count(),
                errors: current.errors.clone(),
                published: false,
            };
        }

        let previous = self.snapshots.load();
        let snapshot = RoutingSnapshot::build(
            previous.generation + 1,
            Arc::new(outcome.config),
            outcome.errors,
            &previous,
            &self.ctx,
        );
        let record = ReconcileRecord {
            generation: snapshot.generation,
            routers: snapshot.routes.len(),
            services: snapshot.pools.len(),
            targets: snapshot.pools.target_count(),
            errors: snapshot.errors.clone(),
            published: true,
        };

        self.snapshots.publish(Arc::new(snapshot));
        self.last_input = Some(input);
        record
    }

    /// Consume events until the channel closes or shutdown is signalled.
    ///
    /// Bursts of events within the debounce window produce one cycle.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TopologyEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!(
            debounce_ms = self.debounce.as_millis() as u64,
            "Reconciler starting"
        );
        let mut deadline: Option<Instant> = None;

        loop {
            let quiet = async move {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.apply(event);
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    None => {
                        if deadline.is_some() {
                            self.reconcile().emit();
                        }
                        tracing::info!("Topology channel closed, reconciler exiting");
                        break;
                    }
                },
                _ = quiet => {
                    deadline = None;
                    self.reconcile().emit();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Reconciler received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
