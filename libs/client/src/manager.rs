//! Client manager.
//!
//! A [`Manager`] keeps one running client per child of the root node whose
//! type matches its config's node type. It rescans the graph:
//! - at start
//! - when a `nodeType` point shows up on the `up.none.>` change stream
//! - on a fixed interval, in case a notification was missed
//! - whenever an instance's client task ends
//!
//! Instances are keyed by (parent, id); a node reachable through two
//! parents gets two instances.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::pending;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use nodemesh_bus::{subject, subscribe_point_stream, Bus, PointStream};
use nodemesh_data::{point_type, NodeConfig};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

use crate::client::{Client, InstanceKey, StopRequest};
use crate::error::{ManagerError, ScanError, StuckInstance, StuckInstanceError};
use crate::instance::{Completion, InstanceHandle};
use crate::store::NodeStore;

type Constructor<C> = Arc<dyn Fn(Arc<dyn Bus>, C) -> Box<dyn Client> + Send + Sync>;

/// Queue depth for instance completions.
const COMPLETION_QUEUE: usize = 64;

/// Shortest accepted interval between periodic rescans.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Options
// =============================================================================

/// Manager timing.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Interval between periodic rescans.
    pub scan_interval: Duration,

    /// How long stop waits for every instance before reporting stuck ones.
    pub shutdown_grace: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// ManagerHandle
// =============================================================================

/// Controls a running [`Manager`] from outside its loop.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    node_type: &'static str,
    stop_tx: Arc<watch::Sender<Option<StopRequest>>>,
    scan_tx: mpsc::Sender<()>,
    running: watch::Receiver<BTreeSet<InstanceKey>>,
}

impl ManagerHandle {
    pub fn node_type(&self) -> &'static str {
        self.node_type
    }

    /// Requests shutdown. Only the first call has an effect.
    pub fn stop(&self, error: Option<String>) {
        self.stop_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(StopRequest { error });
            true
        });
    }

    /// Asks for a rescan. Requests made while one is pending are merged.
    pub fn scan(&self) {
        let _ = self.scan_tx.try_send(());
    }

    /// Keys of the instances currently running and not asked to stop.
    pub fn running(&self) -> BTreeSet<InstanceKey> {
        self.running.borrow().clone()
    }

    /// Waits until the running set satisfies `predicate`.
    ///
    /// Returns `None` if the manager exits first.
    pub async fn wait_running<F>(&self, mut predicate: F) -> Option<BTreeSet<InstanceKey>>
    where
        F: FnMut(&BTreeSet<InstanceKey>) -> bool,
    {
        let mut rx = self.running.clone();
        let matched = rx.wait_for(|keys| predicate(keys)).await.ok()?;
        Some(matched.clone())
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Supervises the clients for every node of type `C::NODE_TYPE`.
pub struct Manager<C: NodeConfig> {
    bus: Arc<dyn Bus>,
    store: Arc<dyn NodeStore>,
    root_id: String,
    construct: Constructor<C>,
    options: ManagerOptions,

    stop_tx: Arc<watch::Sender<Option<StopRequest>>>,
    stop_rx: watch::Receiver<Option<StopRequest>>,
    scan_tx: mpsc::Sender<()>,
    scan_rx: mpsc::Receiver<()>,
    done_tx: mpsc::Sender<Completion>,
    done_rx: mpsc::Receiver<Completion>,
    running_tx: watch::Sender<BTreeSet<InstanceKey>>,

    instances: HashMap<InstanceKey, InstanceHandle>,
    next_generation: u64,
    _config: PhantomData<fn() -> C>,
}

impl<C: NodeConfig> Manager<C> {
    /// Creates a manager for the children of `root_id`.
    ///
    /// `construct` builds a client from the bus and a decoded config.
    pub fn new<K, F>(
        bus: Arc<dyn Bus>,
        store: Arc<dyn NodeStore>,
        root_id: impl Into<String>,
        construct: F,
    ) -> Self
    where
        K: Client,
        F: Fn(Arc<dyn Bus>, C) -> K + Send + Sync + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(None);
        let (scan_tx, scan_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(COMPLETION_QUEUE);
        let (running_tx, _) = watch::channel(BTreeSet::new());

        Self {
            bus,
            store,
            root_id: root_id.into(),
            construct: Arc::new(move |bus: Arc<dyn Bus>, config: C| -> Box<dyn Client> {
                Box::new(construct(bus, config))
            }),
            options: ManagerOptions::default(),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            scan_tx,
            scan_rx,
            done_tx,
            done_rx,
            running_tx,
            instances: HashMap::new(),
            next_generation: 0,
            _config: PhantomData,
        }
    }

    /// Sets the manager timing. A scan interval below [`MIN_SCAN_INTERVAL`]
    /// is raised to it.
    pub fn with_options(mut self, mut options: ManagerOptions) -> Self {
        if options.scan_interval < MIN_SCAN_INTERVAL {
            warn!(
                node_type = C::NODE_TYPE,
                requested_ms = options.scan_interval.as_millis() as u64,
                "Scan interval too short, using minimum"
            );
            options.scan_interval = MIN_SCAN_INTERVAL;
        }
        self.options = options;
        self
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            node_type: C::NODE_TYPE,
            stop_tx: Arc::clone(&self.stop_tx),
            scan_tx: self.scan_tx.clone(),
            running: self.running_tx.subscribe(),
        }
    }

    /// Runs until stopped through a [`ManagerHandle`].
    ///
    /// Returns an error if some instance ignored the stop request for longer
    /// than the shutdown grace period. Those instances are aborted.
    pub async fn start(mut self) -> Result<(), ManagerError> {
        let node_type = C::NODE_TYPE;
        info!(node_type, root_id = %self.root_id, "Starting client manager");

        let mut changes = Some(
            subscribe_point_stream(self.bus.as_ref(), subject::UP_NONE_ALL)
                .await
                .map_err(ManagerError::Subscribe)?,
        );

        self.scan().await;

        let period = self.options.scan_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut grace: Option<Pin<Box<Sleep>>> = None;
        let mut stopping = false;

        loop {
            // Queued change notifications are drained before the scan they
            // request, so a burst of them costs one scan.
            tokio::select! {
                biased;

                changed = self.stop_rx.changed(), if !stopping => {
                    let request = match changed {
                        Ok(()) => self.stop_rx.borrow_and_update().clone(),
                        Err(_) => Some(StopRequest::clean()),
                    };
                    let Some(request) = request else { continue };

                    info!(node_type, error = ?request.error, "Stopping client manager");
                    stopping = true;
                    if let Some(mut stream) = changes.take() {
                        stream.unsubscribe();
                    }

                    for instance in self.instances.values_mut() {
                        instance.stop(request.error.clone());
                    }
                    self.publish_running();

                    if self.instances.is_empty() {
                        break;
                    }
                    grace = Some(Box::pin(sleep(self.options.shutdown_grace)));
                }

                change = next_change(&mut changes), if changes.is_some() => {
                    match change {
                        Some(points) if points.contains_type(point_type::NODE_TYPE) => {
                            debug!(node_type, "Node added or removed, scheduling scan");
                            let _ = self.scan_tx.try_send(());
                        }
                        Some(_) => {}
                        None => {
                            warn!(node_type, "Node change subscription closed, relying on periodic scans");
                            changes = None;
                        }
                    }
                }

                Some(()) = self.scan_rx.recv(), if !stopping => {
                    self.scan().await;
                }

                _ = ticker.tick(), if !stopping => {
                    self.scan().await;
                }

                Some(done) = self.done_rx.recv() => {
                    self.deregister(done);
                    if stopping {
                        if self.instances.is_empty() {
                            break;
                        }
                    } else {
                        self.scan().await;
                    }
                }

                _ = grace_elapsed(&mut grace) => {
                    return Err(self.abort_stuck().into());
                }
            }
        }

        info!(node_type, "Client manager stopped");
        Ok(())
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Reconciles the instance map with the root's current children.
    async fn scan(&mut self) {
        let node_type = C::NODE_TYPE;
        let children = match self
            .store
            .get_children(&self.root_id, node_type, false, false)
            .await
        {
            Ok(children) => children,
            Err(source) => {
                let err = ScanError {
                    root: self.root_id.clone(),
                    node_type,
                    source,
                };
                warn!(error = %err, "Skipping scan");
                return;
            }
        };

        let mut found = HashSet::with_capacity(children.len());
        for child in children {
            if child.is_tombstone() {
                continue;
            }
            let key = InstanceKey::new(&child.parent, &child.id);
            found.insert(key.clone());

            if self.instances.contains_key(&key) {
                continue;
            }

            let config = match C::from_node(&child) {
                Ok(config) => config,
                Err(e) => {
                    warn!(node_type, node_id = %child.id, error = %e, "Skipping node with invalid config");
                    continue;
                }
            };

            self.next_generation += 1;
            let client = (self.construct)(Arc::clone(&self.bus), config);
            let instance = InstanceHandle::spawn(
                key.clone(),
                self.next_generation,
                node_type,
                Arc::clone(&self.bus),
                client,
                self.done_tx.clone(),
            );

            info!(
                node_type,
                node_id = %child.id,
                parent = %child.parent,
                description = child.description(),
                "Starting client"
            );
            self.instances.insert(key, instance);
        }

        for (key, instance) in self.instances.iter_mut() {
            if !found.contains(key) && instance.stop(None) {
                info!(node_type, node_id = %key.id, parent = %key.parent, "Removing client");
            }
        }

        self.publish_running();
    }

    /// Removes the instance a completion belongs to.
    fn deregister(&mut self, done: Completion) {
        let current = self
            .instances
            .get(&done.key)
            .is_some_and(|instance| instance.generation() == done.generation);
        if !current {
            debug!(key = %done.key, generation = done.generation, "Ignoring stale completion");
            return;
        }

        if let Some(instance) = self.instances.remove(&done.key) {
            debug!(
                node_type = C::NODE_TYPE,
                key = %instance.key(),
                clean = done.result.is_ok(),
                "Client deregistered"
            );
        }
        self.publish_running();
    }

    fn publish_running(&self) {
        let running: BTreeSet<InstanceKey> = self
            .instances
            .values()
            .filter(|instance| !instance.stop_requested())
            .map(|instance| instance.key().clone())
            .collect();
        self.running_tx.send_if_modified(|current| {
            if *current == running {
                return false;
            }
            *current = running;
            true
        });
    }

    /// Logs and aborts every instance still registered after the grace period.
    fn abort_stuck(&mut self) -> StuckInstanceError {
        let node_type = C::NODE_TYPE;
        error!(
            node_type,
            remaining = self.instances.len(),
            "BUG: not all clients shut down within the grace period"
        );

        let mut instances: Vec<StuckInstance> = self
            .instances
            .drain()
            .map(|(key, instance)| {
                error!(node_type, node_id = %key.id, parent = %key.parent, "Client stuck");
                instance.abort();
                StuckInstance {
                    node_id: key.id.clone(),
                    key,
                }
            })
            .collect();
        instances.sort_by(|a, b| a.key.cmp(&b.key));
        self.publish_running();

        StuckInstanceError {
            node_type,
            grace: self.options.shutdown_grace,
            instances,
        }
    }
}

async fn next_change(changes: &mut Option<PointStream>) -> Option<nodemesh_data::Points> {
    match changes {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn grace_elapsed(grace: &mut Option<Pin<Box<Sleep>>>) {
    match grace {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}
