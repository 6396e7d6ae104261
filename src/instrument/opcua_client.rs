//! OPC UA transport for the spectrometer controller
//!
//! The `opcua` client API is synchronous, so every request runs on the
//! blocking pool, just like the serial pump driver. The session's message loop
//! runs on its own thread started by `Session::run_async`.
//!
//! Connections are anonymous with no message security, which is how the
//! controller's local server is configured.

use crate::error::{AppResult, DaqError};
use crate::instrument::transport::{MethodArg, NodeTransport, NodeValue, Notification};
use async_trait::async_trait;
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

// Subscription timing in publishing intervals, as the controller's own
// clients request it.
const LIFETIME_COUNT: u32 = 81_000;
const MAX_KEEP_ALIVE_COUNT: u32 = 27_000;

pub struct OpcUaTransport {
    endpoint: String,
    session: Option<Arc<RwLock<Session>>>,
    session_loop: Option<oneshot::Sender<SessionCommand>>,
}

impl OpcUaTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            session: None,
            session_loop: None,
        }
    }

    fn session(&self) -> AppResult<Arc<RwLock<Session>>> {
        self.session
            .clone()
            .ok_or_else(|| DaqError::comm(format!("not connected to {}", self.endpoint)))
    }
}

#[async_trait]
impl NodeTransport for OpcUaTransport {
    async fn connect(&mut self) -> AppResult<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let endpoint = self.endpoint.clone();
        info!(endpoint = %endpoint, "Opening OPC UA session");

        let session = blocking(move || {
            let mut client = ClientBuilder::new()
                .application_name("ReactIR DAQ")
                .application_uri("urn:reactir-daq")
                .product_uri("urn:reactir-daq")
                .trust_server_certs(true)
                .create_sample_keypair(true)
                .session_retry_limit(3)
                .client()
                .ok_or_else(|| DaqError::comm("invalid OPC UA client configuration"))?;

            client
                .connect_to_endpoint(
                    (
                        endpoint.as_str(),
                        SecurityPolicy::None.to_str(),
                        MessageSecurityMode::None,
                        UserTokenPolicy::anonymous(),
                    ),
                    IdentityToken::Anonymous,
                )
                .map_err(|status| {
                    DaqError::comm(format!("connect to {} failed: {}", endpoint, status))
                })
        })
        .await?;

        self.session_loop = Some(Session::run_async(session.clone()));
        self.session = Some(session);
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        if let Some(stop) = self.session_loop.take() {
            // The loop may already have exited on its own.
            let _ = stop.send(SessionCommand::Stop);
        }
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        info!(endpoint = %self.endpoint, "Closing OPC UA session");
        blocking(move || {
            session.read().disconnect();
            Ok(())
        })
        .await
    }

    async fn call_method(
        &mut self,
        parent: &str,
        method: &str,
        args: Vec<MethodArg>,
    ) -> AppResult<()> {
        let session = self.session()?;
        let request = CallMethodRequest {
            object_id: parse_node(parent)?,
            method_id: parse_node(method)?,
            input_arguments: Some(args.into_iter().map(to_variant).collect()),
        };
        let method = method.to_string();

        blocking(move || {
            let result = session
                .read()
                .call(request)
                .map_err(|status| DaqError::comm(format!("{}: {}", method, status)))?;
            if result.status_code.is_good() {
                debug!(method = %method, "Method call succeeded");
                Ok(())
            } else {
                Err(DaqError::comm(format!(
                    "{} returned {}",
                    method, result.status_code
                )))
            }
        })
        .await
    }

    async fn read_value(&mut self, node: &str) -> AppResult<NodeValue> {
        let session = self.session()?;
        let read = ReadValueId {
            node_id: parse_node(node)?,
            attribute_id: AttributeId::Value as u32,
            index_range: UAString::null(),
            data_encoding: QualifiedName::null(),
        };
        let node = node.to_string();

        blocking(move || {
            let mut values = session
                .read()
                .read(&[read], TimestampsToReturn::Neither, 0.0)
                .map_err(|status| DaqError::comm(format!("read {}: {}", node, status)))?;
            let data = values
                .pop()
                .ok_or_else(|| DaqError::comm(format!("read {}: no value returned", node)))?;
            if let Some(status) = data.status {
                if !status.is_good() {
                    return Err(DaqError::comm(format!("read {}: {}", node, status)));
                }
            }
            Ok(variant_to_value(data.value))
        })
        .await
    }

    async fn subscribe(
        &mut self,
        node: &str,
        publishing_interval: Duration,
        sink: mpsc::Sender<Notification>,
    ) -> AppResult<()> {
        let session = self.session()?;
        let node_id = parse_node(node)?;
        let node = node.to_string();
        let interval_ms = publishing_interval.as_secs_f64() * 1000.0;

        blocking(move || {
            let session = session.read();
            let source = node.clone();
            let subscription = session
                .create_subscription(
                    interval_ms,
                    LIFETIME_COUNT,
                    MAX_KEEP_ALIVE_COUNT,
                    0,
                    0,
                    true,
                    DataChangeCallback::new(move |items: &[&MonitoredItem]| {
                        for item in items {
                            let value = variant_to_value(item.last_value().value.clone());
                            let notification = Notification {
                                node: source.clone(),
                                value,
                            };
                            if sink.try_send(notification).is_err() {
                                warn!(node = %source, "Notification dropped, consumer not keeping up");
                            }
                        }
                    }),
                )
                .map_err(|status| {
                    DaqError::comm(format!("create subscription for {}: {}", node, status))
                })?;

            let items: Vec<MonitoredItemCreateRequest> = vec![node_id.into()];
            session
                .create_monitored_items(subscription, TimestampsToReturn::Both, &items)
                .map_err(|status| DaqError::comm(format!("monitor {}: {}", node, status)))?;
            debug!(node = %node, subscription, "Monitoring node");
            Ok(())
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DaqError::comm(format!("OPC UA task failed: {}", e)))?
}

fn parse_node(node: &str) -> AppResult<NodeId> {
    NodeId::from_str(node)
        .map_err(|status| DaqError::comm(format!("invalid node id '{}': {}", node, status)))
}

fn to_variant(arg: MethodArg) -> Variant {
    match arg {
        MethodArg::Text(text) => Variant::from(text),
        MethodArg::Int(value) => Variant::from(value),
        MethodArg::Bool(value) => Variant::from(value),
    }
}

fn variant_to_value(variant: Option<Variant>) -> NodeValue {
    match variant {
        None | Some(Variant::Empty) => NodeValue::Empty,
        Some(Variant::Boolean(value)) => NodeValue::Bool(value),
        Some(Variant::String(text)) => NodeValue::Text(text.as_ref().to_string()),
        Some(Variant::Array(array)) => {
            NodeValue::Series(array.values.iter().filter_map(scalar_to_f64).collect())
        }
        Some(other) => scalar_to_f64(&other).map_or(NodeValue::Empty, NodeValue::Scalar),
    }
}

fn scalar_to_f64(variant: &Variant) -> Option<f64> {
    match variant {
        Variant::Double(v) => Some(*v),
        Variant::Float(v) => Some(f64::from(*v)),
        Variant::SByte(v) => Some(f64::from(*v)),
        Variant::Byte(v) => Some(f64::from(*v)),
        Variant::Int16(v) => Some(f64::from(*v)),
        Variant::UInt16(v) => Some(f64::from(*v)),
        Variant::Int32(v) => Some(f64::from(*v)),
        Variant::UInt32(v) => Some(f64::from(*v)),
        Variant::Int64(v) => Some(*v as f64),
        Variant::UInt64(v) => Some(*v as f64),
        _ => None,
    }
}
