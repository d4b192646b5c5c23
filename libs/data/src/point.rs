//! Points - the atomic, timestamped facts that describe nodes and edges.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known point types.
pub mod point_type {
    /// Carries the node's type in `text`.
    pub const NODE_TYPE: &str = "nodeType";
    /// Edge soft-delete flag.
    pub const TOMBSTONE: &str = "tombstone";
    pub const DESCRIPTION: &str = "description";
    pub const VALUE: &str = "value";
    pub const DISABLE: &str = "disable";
    /// Period in seconds for periodic clients.
    pub const PERIOD: &str = "period";
    pub const COUNT: &str = "count";
}

/// Well-known node types.
pub mod node_type {
    pub const DEVICE: &str = "device";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// A single timestamped fact.
///
/// The owning node or edge is implied by the subject the point travels on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    /// Point type (see [`point_type`]).
    #[serde(rename = "type")]
    pub typ: String,

    /// Disambiguates several points of the same type on one entity.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    /// When the fact was observed. The Unix epoch means "not set".
    #[serde(default)]
    pub time: DateTime<Utc>,

    #[serde(default)]
    pub value: f64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

impl Point {
    /// Creates a numeric point with no time set.
    pub fn new(typ: impl Into<String>, value: f64) -> Self {
        Self {
            typ: typ.into(),
            value,
            ..Default::default()
        }
    }

    /// Creates a text point with no time set.
    pub fn text(typ: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    /// Sets the key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the time.
    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Returns true if no time has been assigned yet.
    pub fn is_zero_time(&self) -> bool {
        self.time == DateTime::<Utc>::default()
    }

    /// Returns true if this point addresses the same (type, key) slot.
    pub fn same_slot(&self, typ: &str, key: &str) -> bool {
        self.typ == typ && normalize_key(&self.key) == normalize_key(key)
    }

    /// Total order used to decide which of two points for one slot wins.
    ///
    /// Later time wins; equal times fall back to value then text so the result
    /// does not depend on arrival order.
    fn precedence(&self, other: &Point) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.value.total_cmp(&other.value))
            .then_with(|| self.text.cmp(&other.text))
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T:{} ", self.typ)?;
        if !self.key.is_empty() {
            write!(f, "K:{} ", self.key)?;
        }
        if !self.text.is_empty() {
            write!(f, "{} ", self.text)?;
        } else {
            write!(f, "V:{} ", self.value)?;
        }
        write!(f, "{}", self.time.to_rfc3339())
    }
}

/// The empty key and "0" address the same slot.
fn normalize_key(key: &str) -> &str {
    if key == "0" {
        ""
    } else {
        key
    }
}

/// An ordered collection of points.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Points(pub Vec<Point>);

impl Points {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.0.iter()
    }

    pub fn push(&mut self, point: Point) {
        self.0.push(point);
    }

    /// Returns the authoritative point for a slot, if any.
    pub fn find(&self, typ: &str, key: &str) -> Option<&Point> {
        self.0
            .iter()
            .filter(|p| p.same_slot(typ, key))
            .max_by(|a, b| a.precedence(b))
    }

    pub fn value(&self, typ: &str, key: &str) -> Option<f64> {
        self.find(typ, key).map(|p| p.value)
    }

    pub fn text(&self, typ: &str, key: &str) -> Option<&str> {
        self.find(typ, key).map(|p| p.text.as_str())
    }

    /// Non-zero values are true.
    pub fn value_bool(&self, typ: &str, key: &str) -> Option<bool> {
        self.value(typ, key).map(|v| v != 0.0)
    }

    /// Returns true if any point in the batch has the given type.
    pub fn contains_type(&self, typ: &str) -> bool {
        self.0.iter().any(|p| p.typ == typ)
    }

    /// Merges a point, keeping only the authoritative point per slot.
    ///
    /// Returns true if the point replaced or extended the collection.
    pub fn merge(&mut self, point: Point) -> bool {
        match self
            .0
            .iter_mut()
            .find(|p| p.same_slot(&point.typ, &point.key))
        {
            Some(existing) => {
                if point.precedence(existing) == Ordering::Greater {
                    *existing = point;
                    true
                } else {
                    false
                }
            }
            None => {
                self.0.push(point);
                true
            }
        }
    }

    /// Assigns `now` to every point that has no time yet.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        for point in self.0.iter_mut().filter(|p| p.is_zero_time()) {
            point.time = now;
        }
    }
}

impl From<Vec<Point>> for Points {
    fn from(points: Vec<Point>) -> Self {
        Self(points)
    }
}

impl FromIterator<Point> for Points {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Points {
    type Item = Point;
    type IntoIter = std::vec::IntoIter<Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Points {
    type Item = &'a Point;
    type IntoIter = std::slice::Iter<'a, Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for point in &self.0 {
            writeln!(f, "  - {}", point)?;
        }
        Ok(())
    }
}

/// Points received for a node or edge, passed through channels inside clients.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPoints {
    pub id: String,
    /// Empty for node points.
    pub parent: String,
    pub points: Points,
}

impl fmt::Display for NewPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "New Points: ID:{}", self.id)?;
        if !self.parent.is_empty() {
            write!(f, "  Parent:{}", self.parent)?;
        }
        writeln!(f)?;
        write!(f, "{}", self.points)
    }
}
