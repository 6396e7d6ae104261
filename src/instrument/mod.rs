//! Spectrometer instrument layer.
//!
//! - `nodes`: server addresses for methods and variables
//! - `spectrum`: samples and the wavenumber axis
//! - `queue`: bounded per-feed spectrum queues
//! - `transport`: protocol seam ([`NodeTransport`])
//! - `session`: experiment state machine over a transport
//! - `simulated`: in-process server for tests and dry runs
//! - `opcua_client`: OPC UA transport (feature `opcua`)

pub mod nodes;
#[cfg(feature = "opcua")]
pub mod opcua_client;
pub mod queue;
pub mod session;
pub mod simulated;
pub mod spectrum;
pub mod transport;

pub use nodes::NodeMap;
#[cfg(feature = "opcua")]
pub use opcua_client::OpcUaTransport;
pub use queue::SpectrumQueue;
pub use session::{SessionState, SpectrometerSession, Transition};
pub use simulated::SimulatedSpectrometer;
pub use spectrum::{Spectrum, SpectrumKind};
pub use transport::{MethodArg, NodeTransport, NodeValue, Notification};
