//! Point transport: encode and send point batches, subscribe and decode.
//!
//! Sends either publish fire-and-forget or wait (bounded by [`ACK_TIMEOUT`])
//! for the store to acknowledge: an empty reply means accepted, anything else
//! is the store's error message.
//!
//! Received batches that fail to decode are logged and dropped. Every point
//! carries its own timestamp, so a lost update is superseded by the next one.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use nodemesh_data::{pb, Point, Points};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::bus::{Bus, Message, Subscription};
use crate::error::TransportError;
use crate::subject;

/// How long an acknowledged send waits for the store.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Sends points to `subject`, stamping points that have no time with now.
pub async fn send_points(
    bus: &dyn Bus,
    subject: &str,
    mut points: Points,
    ack: bool,
) -> Result<(), TransportError> {
    points.stamp(Utc::now());
    let payload = Bytes::from(pb::encode_points(&points)?);

    if ack {
        let reply = bus.request(subject, payload, ACK_TIMEOUT).await?;
        if !reply.payload.is_empty() {
            return Err(TransportError::Rejected(
                String::from_utf8_lossy(&reply.payload).into_owned(),
            ));
        }
        Ok(())
    } else {
        bus.publish(Message::new(subject, payload)).await
    }
}

pub async fn send_node_points(
    bus: &dyn Bus,
    node_id: &str,
    points: Points,
    ack: bool,
) -> Result<(), TransportError> {
    send_points(bus, &subject::node_points(node_id), points, ack).await
}

pub async fn send_node_point(
    bus: &dyn Bus,
    node_id: &str,
    point: Point,
    ack: bool,
) -> Result<(), TransportError> {
    send_node_points(bus, node_id, Points::from(vec![point]), ack).await
}

/// An empty `parent_id` is sent as `"none"`.
pub async fn send_edge_points(
    bus: &dyn Bus,
    node_id: &str,
    parent_id: &str,
    points: Points,
    ack: bool,
) -> Result<(), TransportError> {
    send_points(bus, &subject::edge_points(node_id, parent_id), points, ack).await
}

pub async fn send_edge_point(
    bus: &dyn Bus,
    node_id: &str,
    parent_id: &str,
    point: Point,
    ack: bool,
) -> Result<(), TransportError> {
    send_edge_points(bus, node_id, parent_id, Points::from(vec![point]), ack).await
}

/// Decoded point batches from one subscription.
#[derive(Debug)]
pub struct PointStream {
    sub: Subscription,
}

impl PointStream {
    pub fn subject(&self) -> &str {
        self.sub.subject()
    }

    /// Waits for the next batch that decodes. Cancel safe.
    pub async fn next(&mut self) -> Option<Points> {
        loop {
            let msg = self.sub.next().await?;
            match pb::decode_points(&msg.payload) {
                Ok(points) => return Some(points),
                Err(e) => {
                    warn!(subject = %msg.subject, error = %e, "Error decoding points");
                }
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.sub.unsubscribe();
    }
}

pub async fn subscribe_point_stream(
    bus: &dyn Bus,
    subject: &str,
) -> Result<PointStream, TransportError> {
    Ok(PointStream {
        sub: bus.subscribe(subject).await?,
    })
}

/// A callback subscription. Stops on [`PointSubscription::stop`] or drop.
#[derive(Debug)]
pub struct PointSubscription {
    subject: String,
    task: JoinHandle<()>,
}

impl PointSubscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Unsubscribes. Safe to call more than once.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for PointSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn subscribe_with<F>(
    bus: &dyn Bus,
    subject: String,
    mut callback: F,
) -> Result<PointSubscription, TransportError>
where
    F: FnMut(Points) + Send + 'static,
{
    let mut stream = subscribe_point_stream(bus, &subject).await?;
    let task = tokio::spawn(async move {
        while let Some(points) = stream.next().await {
            callback(points);
        }
    });
    Ok(PointSubscription { subject, task })
}

/// Calls `callback` with every point batch sent to node `id`.
pub async fn subscribe_points<F>(
    bus: &dyn Bus,
    id: &str,
    callback: F,
) -> Result<PointSubscription, TransportError>
where
    F: FnMut(Points) + Send + 'static,
{
    subscribe_with(bus, subject::node_points(id), callback).await
}

/// Calls `callback` with every point batch sent to the edge (`id`, `parent`).
pub async fn subscribe_edge_points<F>(
    bus: &dyn Bus,
    id: &str,
    parent: &str,
    callback: F,
) -> Result<PointSubscription, TransportError>
where
    F: FnMut(Points) + Send + 'static,
{
    subscribe_with(bus, subject::edge_points(id, parent), callback).await
}
