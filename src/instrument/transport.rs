//! Protocol seam between the session and the spectrometer server.
//!
//! The server is a tree of addressable nodes. Methods are called on a parent
//! object with positional arguments, variables are read as scalars or numeric
//! series, and subscriptions push data-change notifications.

use crate::error::AppResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Value read from, or pushed by, a variable node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Empty,
    Bool(bool),
    Scalar(f64),
    Series(Vec<f64>),
    Text(String),
}

impl NodeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NodeValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_series(self) -> Option<Vec<f64>> {
        match self {
            NodeValue::Series(values) => Some(values),
            _ => None,
        }
    }

    /// Short type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeValue::Empty => "empty",
            NodeValue::Bool(_) => "bool",
            NodeValue::Scalar(_) => "scalar",
            NodeValue::Series(_) => "series",
            NodeValue::Text(_) => "text",
        }
    }
}

/// Positional method argument
#[derive(Debug, Clone, PartialEq)]
pub enum MethodArg {
    Text(String),
    Int(i32),
    Bool(bool),
}

/// Data-change notification from a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub node: String,
    pub value: NodeValue,
}

/// Client side of the spectrometer protocol.
///
/// The session owns its transport exclusively, so methods take `&mut self`
/// and only one request is ever in flight.
#[async_trait]
pub trait NodeTransport: Send {
    async fn connect(&mut self) -> AppResult<()>;

    async fn disconnect(&mut self) -> AppResult<()>;

    /// Call `method` on the `parent` object
    async fn call_method(
        &mut self,
        parent: &str,
        method: &str,
        args: Vec<MethodArg>,
    ) -> AppResult<()>;

    async fn read_value(&mut self, node: &str) -> AppResult<NodeValue>;

    /// Forward every data change of `node` into `sink`.
    ///
    /// Delivery must never block on the consumer: implementations use
    /// `try_send` and drop the notification if the sink is full or closed.
    /// The sink is released when the transport disconnects.
    async fn subscribe(
        &mut self,
        node: &str,
        publishing_interval: Duration,
        sink: mpsc::Sender<Notification>,
    ) -> AppResult<()>;
}
