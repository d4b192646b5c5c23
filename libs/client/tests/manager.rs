//! Manager lifecycle tests against an in-memory store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nodemesh_bus::{send_points, subject, MemoryBus};
use nodemesh_client::{
    Client, ClientContext, InstanceKey, Manager, ManagerError, ManagerHandle, ManagerOptions,
    NodeStore, StopRequest, StoreError,
};
use nodemesh_data::{point_type, DecodeError, NodeConfig, NodeEdge, Point, Points};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

// =============================================================================
// Test doubles
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Bus {
    id: String,
    parent: String,
    description: String,
    period: f64,
}

impl NodeConfig for Bus {
    const NODE_TYPE: &'static str = "bus";

    fn from_node(node: &NodeEdge) -> Result<Self, DecodeError> {
        Self::check_type(node)?;
        let period = node
            .points
            .value(point_type::PERIOD, "")
            .ok_or_else(|| DecodeError::MissingPoint {
                node_id: node.id.clone(),
                point_type: point_type::PERIOD.to_string(),
            })?;
        Ok(Bus {
            id: node.id.clone(),
            parent: node.parent.clone(),
            description: node.description().to_string(),
            period,
        })
    }
}

#[derive(Default)]
struct GraphStore {
    children: Mutex<Vec<NodeEdge>>,
    unavailable: AtomicBool,
    queries: AtomicUsize,
    /// While set, child queries wait for `release`.
    held: AtomicBool,
    release: Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GraphStore {
    fn set(&self, children: Vec<NodeEdge>) {
        *self.children.lock().unwrap() = children;
    }
}

#[async_trait]
impl NodeStore for GraphStore {
    async fn get_children(
        &self,
        id: &str,
        node_type: &str,
        include_deleted: bool,
        _recursive: bool,
    ) -> Result<Vec<NodeEdge>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if self.held.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("store offline".to_string()));
        }
        let children = self.children.lock().unwrap();
        Ok(children
            .iter()
            .filter(|n| n.parent == id || id == "root")
            .filter(|n| node_type.is_empty() || n.typ == node_type)
            .filter(|n| include_deleted || !n.is_tombstone())
            .cloned()
            .collect())
    }

    async fn get_node(&self, id: &str, _parent: &str) -> Result<Vec<NodeEdge>, StoreError> {
        let children = self.children.lock().unwrap();
        Ok(children.iter().filter(|n| n.id == id).cloned().collect())
    }
}

#[derive(Debug)]
enum Event {
    Started(Bus),
    Stopped(InstanceKey, StopRequest),
}

/// Reports its lifecycle and runs until stopped.
struct Recorder {
    config: Bus,
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl Client for Recorder {
    async fn start(&mut self, mut ctx: ClientContext) -> anyhow::Result<()> {
        let _ = self.events.send(Event::Started(self.config.clone()));
        let request = ctx.stop.stopped().await;
        let _ = self.events.send(Event::Stopped(ctx.key, request));
        Ok(())
    }
}

fn bus_node(id: &str, description: &str) -> NodeEdge {
    NodeEdge {
        id: id.to_string(),
        typ: "bus".to_string(),
        parent: "root".to_string(),
        points: Points::from(vec![
            Point::text(point_type::DESCRIPTION, description),
            Point::new(point_type::PERIOD, 1.0),
        ]),
        ..Default::default()
    }
}

struct Harness {
    bus: MemoryBus,
    store: Arc<GraphStore>,
    handle: ManagerHandle,
    events: mpsc::UnboundedReceiver<Event>,
    task: JoinHandle<Result<(), ManagerError>>,
}

fn start_recording(children: Vec<NodeEdge>) -> Harness {
    let bus = MemoryBus::new();
    let store = Arc::new(GraphStore::default());
    store.set(children);

    let (tx, events) = mpsc::unbounded_channel();
    let manager = Manager::<Bus>::new(
        Arc::new(bus.clone()),
        store.clone(),
        "root",
        move |_bus, config| Recorder {
            config,
            events: tx.clone(),
        },
    );
    let handle = manager.handle();
    let task = tokio::spawn(manager.start());

    Harness {
        bus,
        store,
        handle,
        events,
        task,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("event channel open")
}

fn keys(ids: &[&str]) -> std::collections::BTreeSet<InstanceKey> {
    ids.iter().map(|id| InstanceKey::new("root", *id)).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_starts_one_client_per_child() {
    let mut h = start_recording(vec![bus_node("b1", "bus one")]);

    match next_event(&mut h.events).await {
        Event::Started(config) => assert_eq!(
            config,
            Bus {
                id: "b1".to_string(),
                parent: "root".to_string(),
                description: "bus one".to_string(),
                period: 1.0,
            }
        ),
        other => panic!("unexpected event: {other:?}"),
    }

    let running = h.handle.wait_running(|k| !k.is_empty()).await.unwrap();
    assert_eq!(running, keys(&["b1"]));

    h.handle.stop(None);
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_node_type_point_triggers_scan() {
    let h = start_recording(vec![bus_node("b1", "bus one")]);
    h.handle.wait_running(|k| k.len() == 1).await.unwrap();

    h.store.set(vec![bus_node("b1", "bus one"), bus_node("b2", "bus two")]);
    send_points(
        &h.bus,
        &subject::up_points("none", "b2"),
        Points::from(vec![Point::text(point_type::NODE_TYPE, "bus")]),
        false,
    )
    .await
    .unwrap();

    let running = h.handle.wait_running(|k| k.len() == 2).await.unwrap();
    assert_eq!(running, keys(&["b1", "b2"]));

    h.handle.stop(None);
    h.task.await.unwrap().unwrap();
}

async fn wait_for_queries(store: &GraphStore, above: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.queries.load(Ordering::SeqCst) <= above {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("scan in time");
}

#[tokio::test]
async fn test_change_burst_coalesces_into_one_scan() {
    const BURST: usize = 50;

    let h = start_recording(vec![bus_node("b1", "bus one")]);
    h.handle.wait_running(|k| k.len() == 1).await.unwrap();

    // Park a scan inside the store.
    h.store.held.store(true, Ordering::SeqCst);
    let before = h.store.queries.load(Ordering::SeqCst);
    h.handle.scan();
    wait_for_queries(&h.store, before).await;

    h.store.set(vec![bus_node("b1", "bus one"), bus_node("b2", "bus two")]);
    for i in 0..BURST {
        send_points(
            &h.bus,
            &subject::up_points("none", &format!("n{i}")),
            Points::from(vec![Point::text(point_type::NODE_TYPE, "bus")]),
            false,
        )
        .await
        .unwrap();
    }

    h.store.held.store(false, Ordering::SeqCst);
    h.store.release.notify_one();

    let running = h.handle.wait_running(|k| k.len() == 2).await.unwrap();
    assert_eq!(running, keys(&["b1", "b2"]));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let scans = h.store.queries.load(Ordering::SeqCst) - before;
    assert!(scans <= 3, "{scans} scans for {BURST} notifications");
    assert_eq!(h.store.max_in_flight.load(Ordering::SeqCst), 1);

    h.handle.stop(None);
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_removed_node_is_stopped_and_deregistered() {
    let mut h = start_recording(vec![bus_node("b1", "bus one"), bus_node("b2", "bus two")]);
    h.handle.wait_running(|k| k.len() == 2).await.unwrap();

    h.store.set(vec![bus_node("b2", "bus two")]);
    h.handle.scan();

    loop {
        if let Event::Stopped(key, request) = next_event(&mut h.events).await {
            assert_eq!(key, InstanceKey::new("root", "b1"));
            assert_eq!(request, StopRequest::clean());
            break;
        }
    }

    let running = h.handle.wait_running(|k| k.len() == 1).await.unwrap();
    assert_eq!(running, keys(&["b2"]));

    h.handle.stop(None);
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_skipped() {
    let mut broken = bus_node("b2", "no period");
    broken.points = Points::from(vec![Point::text(point_type::DESCRIPTION, "no period")]);

    let h = start_recording(vec![bus_node("b1", "bus one"), broken]);

    let running = h.handle.wait_running(|k| !k.is_empty()).await.unwrap();
    assert_eq!(running, keys(&["b1"]));

    // Another scan still leaves the broken node alone.
    h.handle.scan();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.running(), keys(&["b1"]));

    h.handle.stop(None);
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tombstoned_child_gets_no_instance() {
    let mut deleted = bus_node("b2", "deleted");
    deleted.edge_points = Points::from(vec![Point::new(point_type::TOMBSTONE, 1.0)]);

    let h = start_recording(vec![bus_node("b1", "bus one"), deleted]);
    let running = h.handle.wait_running(|k| !k.is_empty()).await.unwrap();
    assert_eq!(running, keys(&["b1"]));

    h.handle.stop(None);
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent_and_forwards_error() {
    let mut h = start_recording(vec![bus_node("b1", "bus one")]);
    h.handle.wait_running(|k| k.len() == 1).await.unwrap();

    h.handle.stop(Some("shutting down".to_string()));
    h.handle.stop(Some("second reason".to_string()));
    h.task.await.unwrap().unwrap();

    let mut stopped = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        if let Event::Stopped(_, request) = event {
            stopped.push(request);
        }
    }
    assert_eq!(stopped, vec![StopRequest::with_error("shutting down")]);

    // Stopping an exited manager does nothing.
    h.handle.stop(None);
}

#[tokio::test]
async fn test_store_outage_skips_scan() {
    let h = start_recording(vec![]);
    h.store.unavailable.store(true, Ordering::SeqCst);
    h.store.set(vec![bus_node("b1", "bus one")]);

    let before = h.store.queries.load(Ordering::SeqCst);
    h.handle.scan();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.store.queries.load(Ordering::SeqCst) > before);
    assert!(h.handle.running().is_empty());

    h.store.unavailable.store(false, Ordering::SeqCst);
    h.handle.scan();
    let running = h.handle.wait_running(|k| !k.is_empty()).await.unwrap();
    assert_eq!(running, keys(&["b1"]));

    h.handle.stop(None);
    h.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_scan_picks_up_missed_changes() {
    let h = start_recording(vec![]);
    while h.store.queries.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    let started = tokio::time::Instant::now();

    // No notification is sent; only the interval scan can find it.
    h.store.set(vec![bus_node("b1", "bus one")]);
    let running = h.handle.wait_running(|k| !k.is_empty()).await.unwrap();

    assert_eq!(running, keys(&["b1"]));
    assert!(started.elapsed() >= Duration::from_secs(60));

    h.handle.stop(None);
    h.task.await.unwrap().unwrap();
}

/// Returns on its first run, then behaves.
struct GivesUpOnce {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Client for GivesUpOnce {
    async fn start(&mut self, mut ctx: ClientContext) -> anyhow::Result<()> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("lost connection");
        }
        ctx.stop.stopped().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_client_that_exits_is_restarted() {
    let store = Arc::new(GraphStore::default());
    store.set(vec![bus_node("b1", "bus one")]);
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let manager = Manager::<Bus>::new(Arc::new(MemoryBus::new()), store, "root", move |_, _| {
        GivesUpOnce {
            runs: counter.clone(),
        }
    });
    let handle = manager.handle();
    let task = tokio::spawn(manager.start());

    tokio::time::timeout(Duration::from_secs(5), async {
        while runs.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(handle.running(), keys(&["b1"]));

    handle.stop(None);
    task.await.unwrap().unwrap();
}

/// Ignores stop requests.
struct Stubborn;

#[async_trait]
impl Client for Stubborn {
    async fn start(&mut self, _ctx: ClientContext) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_stuck_client_is_reported_after_grace() {
    let store = Arc::new(GraphStore::default());
    store.set(vec![bus_node("b1", "bus one"), bus_node("b2", "bus two")]);

    let manager = Manager::<Bus>::new(Arc::new(MemoryBus::new()), store, "root", |_, _| Stubborn)
        .with_options(ManagerOptions {
            scan_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        });
    let handle = manager.handle();
    let task = tokio::spawn(manager.start());
    handle.wait_running(|k| k.len() == 2).await.unwrap();

    let started = tokio::time::Instant::now();
    handle.stop(None);
    let err = task.await.unwrap().unwrap_err();
    assert!(started.elapsed() >= Duration::from_secs(5));

    match err {
        ManagerError::Stuck(stuck) => {
            assert_eq!(stuck.node_type, "bus");
            let ids: Vec<&str> = stuck.instances.iter().map(|i| i.node_id.as_str()).collect();
            assert_eq!(ids, vec!["b1", "b2"]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_flapping_child_settles() {
    let mut h = start_recording(vec![bus_node("b1", "bus one")]);
    h.handle.wait_running(|k| k.len() == 1).await.unwrap();

    for _ in 0..5 {
        h.store.set(vec![]);
        h.handle.scan();
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.store.set(vec![bus_node("b1", "bus one")]);
        h.handle.scan();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let running = h.handle.wait_running(|k| k.len() == 1).await.unwrap();
    assert_eq!(running, keys(&["b1"]));

    h.handle.stop(None);
    h.task.await.unwrap().unwrap();

    // Every started instance was stopped exactly once.
    let (mut started, mut stopped) = (0, 0);
    while let Ok(event) = h.events.try_recv() {
        match event {
            Event::Started(_) => started += 1,
            Event::Stopped(..) => stopped += 1,
        }
    }
    assert_eq!(started, stopped);
}
