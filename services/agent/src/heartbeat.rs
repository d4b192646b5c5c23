//! Heartbeat client.
//!
//! Sends an incrementing `count` point to its own node every `period`
//! seconds. The client restarts itself (by returning) when its period
//! changes or its edge is deleted; the manager then rebuilds it from the
//! current config, or drops it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodemesh_bus::{send_node_point, subject, subscribe_point_stream, Bus};
use nodemesh_client::{Client, ClientContext};
use nodemesh_data::{node_type, point_type, DecodeError, NodeConfig, NodeEdge, Point, Points};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Heartbeat node configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub id: String,
    pub parent: String,
    pub description: String,
    pub period: Duration,
    pub disable: bool,
}

impl NodeConfig for Heartbeat {
    const NODE_TYPE: &'static str = node_type::HEARTBEAT;

    fn from_node(node: &NodeEdge) -> Result<Self, DecodeError> {
        Self::check_type(node)?;

        let secs = node
            .points
            .value(point_type::PERIOD, "")
            .ok_or_else(|| DecodeError::MissingPoint {
                node_id: node.id.clone(),
                point_type: point_type::PERIOD.to_string(),
            })?;
        let period = parse_period(&node.id, secs)?;

        Ok(Self {
            id: node.id.clone(),
            parent: node.parent.clone(),
            description: node.description().to_string(),
            period,
            disable: node
                .points
                .value_bool(point_type::DISABLE, "")
                .unwrap_or(false),
        })
    }
}

fn parse_period(node_id: &str, secs: f64) -> Result<Duration, DecodeError> {
    let invalid = |reason: String| DecodeError::InvalidPoint {
        node_id: node_id.to_string(),
        point_type: point_type::PERIOD.to_string(),
        reason,
    };
    if secs <= 0.0 {
        return Err(invalid(format!("period must be positive, got {secs}")));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(e.to_string()))
}

/// Why a running heartbeat gives up.
#[derive(Debug, PartialEq)]
enum Update {
    Continue,
    Restart(&'static str),
}

pub struct HeartbeatClient {
    bus: Arc<dyn Bus>,
    config: Heartbeat,
    count: u64,
}

impl HeartbeatClient {
    pub fn new(bus: Arc<dyn Bus>, config: Heartbeat) -> Self {
        Self {
            bus,
            config,
            count: 0,
        }
    }

    fn node_update(&mut self, points: &Points) -> Update {
        for point in points.iter() {
            match point.typ.as_str() {
                point_type::PERIOD => {
                    let changed = parse_period(&self.config.id, point.value)
                        .map_or(true, |period| period != self.config.period);
                    if changed {
                        return Update::Restart("period changed");
                    }
                }
                point_type::DISABLE => self.config.disable = point.value != 0.0,
                point_type::DESCRIPTION => self.config.description = point.text.clone(),
                _ => {}
            }
        }
        Update::Continue
    }

    fn edge_update(&self, points: &Points) -> Update {
        if points.value_bool(point_type::TOMBSTONE, "") == Some(true) {
            Update::Restart("node deleted")
        } else {
            Update::Continue
        }
    }

    async fn beat(&mut self) {
        self.count += 1;
        let point = Point::new(point_type::COUNT, self.count as f64);
        if let Err(e) = send_node_point(self.bus.as_ref(), &self.config.id, point, false).await {
            warn!(node_id = %self.config.id, error = %e, "Error sending heartbeat");
        }
    }
}

#[async_trait]
impl Client for HeartbeatClient {
    async fn start(&mut self, mut ctx: ClientContext) -> anyhow::Result<()> {
        let id = self.config.id.clone();
        let mut node_points =
            subscribe_point_stream(self.bus.as_ref(), &subject::node_points(&id)).await?;
        let mut edge_points = subscribe_point_stream(
            self.bus.as_ref(),
            &subject::edge_points(&id, &self.config.parent),
        )
        .await?;

        let mut ticker = tokio::time::interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            node_id = %id,
            description = %self.config.description,
            period_ms = self.config.period.as_millis() as u64,
            disabled = self.config.disable,
            "Heartbeat started"
        );

        loop {
            let update = tokio::select! {
                request = ctx.stop.stopped() => {
                    debug!(node_id = %id, error = ?request.error, "Heartbeat stop requested");
                    return Ok(());
                }
                _ = ticker.tick(), if !self.config.disable => {
                    self.beat().await;
                    Update::Continue
                }
                Some(points) = node_points.next() => self.node_update(&points),
                Some(points) = edge_points.next() => self.edge_update(&points),
            };

            if let Update::Restart(reason) = update {
                info!(node_id = %id, reason, "Heartbeat restarting");
                return Ok(());
            }
        }
    }
}
