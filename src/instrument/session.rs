//! Spectrometer session
//!
//! [`SpectrometerSession`] drives one experiment on the spectrometer
//! controller through a [`NodeTransport`]. It tracks the session state
//! explicitly:
//!
//! ```text
//! Disconnected ──connect──▶ Connected ──start──▶ Running ◀──resume── Paused
//!       ▲                                          │  └──pause──▶ ───┘  │
//!       └────────── disconnect ◀── Stopped ◀──stop─┴────────────────────┘
//! ```
//!
//! Repeating an operation whose goal already holds (pausing a paused run,
//! connecting twice) is not an error and returns [`Transition::Ignored`].
//! Starting a second experiment while one is active is rejected with
//! [`DaqError::IllegalTransition`].
//!
//! Every operation that needs the server connects on first use. All calls go
//! through one mutex, so only one request is in flight per session.
//!
//! Raw and treated spectra arrive through subscriptions. Each feed has its own
//! task that moves notifications into a bounded [`SpectrumQueue`]; the feeds
//! never wait on each other or on the control flow.

use crate::config::InstrumentConfig;
use crate::error::{AppResult, DaqError};
use crate::instrument::nodes::NodeMap;
use crate::instrument::queue::SpectrumQueue;
use crate::instrument::spectrum::{load_wavenumbers, Spectrum, SpectrumKind};
use crate::instrument::transport::{MethodArg, NodeTransport, NodeValue, Notification};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shortest sampling interval the instrument accepts, in seconds.
pub const MIN_SAMPLING_INTERVAL_S: u32 = 15;
/// Longest sampling interval the instrument accepts, in seconds.
pub const MAX_SAMPLING_INTERVAL_S: u32 = 3600;

/// How long shutdown waits for feeds to flush before aborting them
const FEED_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Running,
    Paused,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
        }
    }

    /// An experiment is acquiring or paused
    pub fn has_experiment(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Paused)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a state-changing call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Transition {
    /// The call changed the session state
    Applied,
    /// The session was already where the call would have taken it, or the
    /// call does not apply in the current state; nothing was sent
    Ignored,
}

struct SessionInner {
    transport: Box<dyn NodeTransport>,
    state: SessionState,
    sampling_interval_s: Option<u32>,
    last_background: Option<Spectrum>,
    raw_subscribed: bool,
    treated_subscribed: bool,
    feeds: Vec<JoinHandle<()>>,
}

/// Client session for the spectrometer controller
pub struct SpectrometerSession {
    nodes: NodeMap,
    wavenumbers: Arc<[f64]>,
    publishing_interval: Duration,
    raw: SpectrumQueue,
    treated: SpectrumQueue,
    inner: Mutex<SessionInner>,
}

impl SpectrometerSession {
    /// Create a session
    ///
    /// # Arguments
    /// * `transport` - Protocol client, not yet connected
    /// * `nodes` - Server addresses
    /// * `wavenumbers` - Axis shared by every spectrum
    /// * `queue_capacity` - Depth of each spectrum queue
    /// * `publishing_interval` - Requested subscription publishing interval
    pub fn new(
        transport: Box<dyn NodeTransport>,
        nodes: NodeMap,
        wavenumbers: Arc<[f64]>,
        queue_capacity: usize,
        publishing_interval: Duration,
    ) -> Self {
        Self {
            nodes,
            wavenumbers,
            publishing_interval,
            raw: SpectrumQueue::new(SpectrumKind::Raw, queue_capacity),
            treated: SpectrumQueue::new(SpectrumKind::Treated, queue_capacity),
            inner: Mutex::new(SessionInner {
                transport,
                state: SessionState::Disconnected,
                sampling_interval_s: None,
                last_background: None,
                raw_subscribed: false,
                treated_subscribed: false,
                feeds: Vec::new(),
            }),
        }
    }

    /// Create a session from configuration, loading the wavenumber table
    pub fn from_config(
        transport: Box<dyn NodeTransport>,
        config: &InstrumentConfig,
    ) -> AppResult<Self> {
        let wavenumbers = load_wavenumbers(&config.wavenumber_table)?;
        debug!(
            points = wavenumbers.len(),
            table = %config.wavenumber_table.display(),
            "Loaded wavenumber axis"
        );
        Ok(Self::new(
            transport,
            config.nodes.clone(),
            wavenumbers,
            config.queue_capacity,
            Duration::from_millis(config.publishing_interval_ms),
        ))
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    pub fn wavenumbers(&self) -> Arc<[f64]> {
        self.wavenumbers.clone()
    }

    /// Consumer handle for raw spectra
    pub fn raw_queue(&self) -> SpectrumQueue {
        self.raw.clone()
    }

    /// Consumer handle for treated spectra
    pub fn treated_queue(&self) -> SpectrumQueue {
        self.treated.clone()
    }

    /// Last sampling interval accepted by [`Self::set_sampling_interval`]
    pub async fn sampling_interval(&self) -> Option<u32> {
        self.inner.lock().await.sampling_interval_s
    }

    /// Background fetched by the last [`Self::get_last_background_spectrum`]
    pub async fn cached_background(&self) -> Option<Spectrum> {
        self.inner.lock().await.last_background.clone()
    }

    pub async fn connect(&self) -> AppResult<Transition> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Disconnected {
            return Ok(Transition::Ignored);
        }
        Self::connect_locked(&mut inner).await?;
        Ok(Transition::Applied)
    }

    pub async fn disconnect(&self) -> AppResult<Transition> {
        let mut inner = self.inner.lock().await;
        Self::disconnect_locked(&mut inner).await
    }

    /// Start acquisition into `experiment_name` using `template_name`
    ///
    /// The instrument does not deduplicate experiment names; checking that
    /// the destination is unused is up to the caller.
    pub async fn start_experiment(
        &self,
        experiment_name: &str,
        template_name: &str,
        collect_background: bool,
    ) -> AppResult<Transition> {
        let mut inner = self.inner.lock().await;
        if inner.state.has_experiment() {
            return Err(DaqError::IllegalTransition {
                operation: "start an experiment",
                state: inner.state.as_str(),
            });
        }
        Self::ensure_connected(&mut inner).await?;

        info!(
            experiment = experiment_name,
            template = template_name,
            collect_background,
            "Starting spectrometer experiment"
        );
        self.call(
            &mut inner,
            &self.nodes.start_experiment,
            vec![
                MethodArg::Text(experiment_name.to_string()),
                MethodArg::Text(template_name.to_string()),
                MethodArg::Bool(collect_background),
            ],
        )
        .await?;
        inner.state = SessionState::Running;
        Ok(Transition::Applied)
    }

    /// Pause acquisition; only acts while running
    pub async fn pause_experiment(&self) -> AppResult<Transition> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Running {
            debug!(state = %inner.state, "Pause ignored");
            return Ok(Transition::Ignored);
        }
        self.call(&mut inner, &self.nodes.pause, Vec::new()).await?;
        inner.state = SessionState::Paused;
        info!("Spectrometer acquisition paused");
        Ok(Transition::Applied)
    }

    /// Resume acquisition; only acts while paused
    pub async fn resume_experiment(&self) -> AppResult<Transition> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Paused {
            debug!(state = %inner.state, "Resume ignored");
            return Ok(Transition::Ignored);
        }
        self.call(&mut inner, &self.nodes.resume, Vec::new()).await?;
        inner.state = SessionState::Running;
        info!("Spectrometer acquisition resumed");
        Ok(Transition::Applied)
    }

    /// Stop the experiment and disconnect
    ///
    /// A running experiment is paused first so the instrument is in a known
    /// state when the stop arrives. The session ends disconnected whether or
    /// not an experiment was active, and also when the pause or stop call
    /// fails; that error is still returned.
    pub async fn stop_experiment(&self) -> AppResult<Transition> {
        let mut inner = self.inner.lock().await;
        let stopped = self.stop_locked(&mut inner).await;
        let disconnected = Self::disconnect_locked(&mut inner).await;
        inner.state = SessionState::Disconnected;
        let transition = stopped?;
        disconnected?;
        Ok(transition)
    }

    /// Set the delay between acquisitions
    ///
    /// # Errors
    /// `OutOfRangeInterval` unless `15 <= seconds <= 3600`; nothing is sent
    /// to the instrument in that case.
    pub async fn set_sampling_interval(&self, seconds: u32) -> AppResult<()> {
        if !(MIN_SAMPLING_INTERVAL_S..=MAX_SAMPLING_INTERVAL_S).contains(&seconds) {
            return Err(DaqError::OutOfRangeInterval {
                seconds,
                min: MIN_SAMPLING_INTERVAL_S,
                max: MAX_SAMPLING_INTERVAL_S,
            });
        }

        let mut inner = self.inner.lock().await;
        Self::ensure_connected(&mut inner).await?;
        // The instrument's method argument is a 32-bit integer; range checked above.
        self.call(
            &mut inner,
            &self.nodes.set_sampling_interval,
            vec![MethodArg::Int(seconds as i32)],
        )
        .await?;
        inner.sampling_interval_s = Some(seconds);
        info!(seconds, "Sampling interval set");
        Ok(())
    }

    /// Read the sampling interval the instrument is actually using
    pub async fn get_current_sampling_interval(&self) -> AppResult<f64> {
        let mut inner = self.inner.lock().await;
        Self::ensure_connected(&mut inner).await?;
        let node = &self.nodes.current_sampling_interval;
        let value = inner.transport.read_value(node).await?;
        let seconds = value.as_f64().ok_or_else(|| DaqError::UnexpectedValue {
            node: node.clone(),
            detail: format!("expected a scalar, got {}", value.type_name()),
        })?;

        if let Some(requested) = inner.sampling_interval_s {
            if (seconds - f64::from(requested)).abs() > 0.5 {
                warn!(
                    requested,
                    actual = seconds,
                    "Instrument sampling interval differs from the requested value"
                );
            }
        }
        Ok(seconds)
    }

    /// Fetch the most recent background scan
    pub async fn get_last_background_spectrum(&self) -> AppResult<Spectrum> {
        let mut inner = self.inner.lock().await;
        Self::ensure_connected(&mut inner).await?;
        let node = &self.nodes.background_spectra;
        let value = inner.transport.read_value(node).await?;
        let type_name = value.type_name();
        let intensities = value
            .into_series()
            .ok_or_else(|| DaqError::UnexpectedValue {
                node: node.clone(),
                detail: format!("expected a series, got {}", type_name),
            })?;

        let background = Spectrum::new(
            SpectrumKind::Background,
            0,
            self.wavenumbers.clone(),
            intensities,
        );
        inner.last_background = Some(background.clone());
        Ok(background)
    }

    /// Subscribe to raw spectra; they appear in [`Self::raw_queue`]
    pub async fn subscribe_raw(&self) -> AppResult<Transition> {
        self.subscribe(SpectrumKind::Raw).await
    }

    /// Subscribe to treated spectra; they appear in [`Self::treated_queue`]
    pub async fn subscribe_treated(&self) -> AppResult<Transition> {
        self.subscribe(SpectrumKind::Treated).await
    }

    /// Stop any active experiment and disconnect
    ///
    /// Always leaves the session disconnected, even if the instrument reports
    /// an error on the way down; that error is still returned.
    pub async fn shutdown(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let stopped = if inner.state.has_experiment() {
            self.stop_locked(&mut inner).await.map(|_| ())
        } else {
            Ok(())
        };
        let disconnected = Self::disconnect_locked(&mut inner).await.map(|_| ());
        inner.state = SessionState::Disconnected;
        let feeds = std::mem::take(&mut inner.feeds);
        drop(inner);

        for mut feed in feeds {
            if tokio::time::timeout(FEED_DRAIN_TIMEOUT, &mut feed)
                .await
                .is_err()
            {
                feed.abort();
            }
        }

        stopped.and(disconnected)
    }

    async fn subscribe(&self, kind: SpectrumKind) -> AppResult<Transition> {
        let mut inner = self.inner.lock().await;
        let (node, queue) = match kind {
            SpectrumKind::Raw if inner.raw_subscribed => return Ok(Transition::Ignored),
            SpectrumKind::Treated if inner.treated_subscribed => {
                return Ok(Transition::Ignored)
            }
            SpectrumKind::Raw => (&self.nodes.raw_spectra, &self.raw),
            SpectrumKind::Treated => (&self.nodes.treated_spectra, &self.treated),
            SpectrumKind::Background => {
                return Err(DaqError::IllegalTransition {
                    operation: "subscribe to background spectra",
                    state: inner.state.as_str(),
                })
            }
        };
        Self::ensure_connected(&mut inner).await?;

        let (sink, notifications) = mpsc::channel(queue.capacity());
        inner
            .transport
            .subscribe(node, self.publishing_interval, sink)
            .await?;
        let feed = spawn_feed(queue.clone(), self.wavenumbers.clone(), notifications);
        inner.feeds.retain(|handle| !handle.is_finished());
        inner.feeds.push(feed);
        match kind {
            SpectrumKind::Raw => inner.raw_subscribed = true,
            _ => inner.treated_subscribed = true,
        }
        info!(feed = %kind, node = %node, "Subscribed to spectra");
        Ok(Transition::Applied)
    }

    async fn stop_locked(&self, inner: &mut SessionInner) -> AppResult<Transition> {
        if !inner.state.has_experiment() {
            debug!(state = %inner.state, "Stop ignored");
            return Ok(Transition::Ignored);
        }
        if inner.state == SessionState::Running {
            self.call(inner, &self.nodes.pause, Vec::new()).await?;
            inner.state = SessionState::Paused;
        }
        self.call(inner, &self.nodes.stop, Vec::new()).await?;
        inner.state = SessionState::Stopped;
        info!("Spectrometer experiment stopped");
        Ok(Transition::Applied)
    }

    async fn call(
        &self,
        inner: &mut SessionInner,
        method: &str,
        args: Vec<MethodArg>,
    ) -> AppResult<()> {
        debug!(method, ?args, "Calling instrument method");
        inner
            .transport
            .call_method(&self.nodes.methods, method, args)
            .await
    }

    async fn ensure_connected(inner: &mut SessionInner) -> AppResult<()> {
        if matches!(
            inner.state,
            SessionState::Disconnected | SessionState::Stopped
        ) {
            Self::connect_locked(inner).await?;
        }
        Ok(())
    }

    async fn connect_locked(inner: &mut SessionInner) -> AppResult<()> {
        info!("Connecting to spectrometer");
        inner.transport.connect().await?;
        inner.state = SessionState::Connected;
        Ok(())
    }

    async fn disconnect_locked(inner: &mut SessionInner) -> AppResult<Transition> {
        if inner.state == SessionState::Disconnected {
            return Ok(Transition::Ignored);
        }
        if inner.state.has_experiment() {
            warn!(state = %inner.state, "Disconnecting while an experiment is still active");
        }
        info!("Disconnecting from spectrometer");
        let result = inner.transport.disconnect().await;
        inner.state = SessionState::Disconnected;
        inner.raw_subscribed = false;
        inner.treated_subscribed = false;
        result.map(|_| Transition::Applied)
    }
}

/// Move notifications for one feed into its queue, in arrival order
fn spawn_feed(
    queue: SpectrumQueue,
    wavenumbers: Arc<[f64]>,
    mut notifications: mpsc::Receiver<Notification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let kind = queue.kind();
        let mut sequence = queue.pushed_count();
        while let Some(notification) = notifications.recv().await {
            let intensities = match notification.value {
                NodeValue::Series(values) => values,
                other => {
                    warn!(
                        feed = %kind,
                        node = %notification.node,
                        value_type = other.type_name(),
                        "Ignoring notification without spectrum data"
                    );
                    continue;
                }
            };
            if intensities.len() != wavenumbers.len() {
                warn!(
                    feed = %kind,
                    points = intensities.len(),
                    axis = wavenumbers.len(),
                    "Spectrum length does not match wavenumber axis"
                );
            }

            let spectrum = Spectrum::new(kind, sequence, wavenumbers.clone(), intensities);
            sequence += 1;
            if let Some(evicted) = queue.push(spectrum) {
                warn!(
                    feed = %kind,
                    sequence = evicted.sequence,
                    "Spectrum queue full, dropped oldest sample"
                );
            }
        }
        debug!(feed = %kind, "Spectrum feed closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::simulated::{RecordedCall, SimulatedSpectrometer};

    fn session_with(sim: &SimulatedSpectrometer) -> SpectrometerSession {
        SpectrometerSession::new(
            Box::new(sim.clone()),
            NodeMap::default(),
            vec![1000.0, 1001.0, 1002.0].into(),
            16,
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_operations_auto_connect() {
        let sim = SimulatedSpectrometer::new(NodeMap::default(), 3);
        let session = session_with(&sim);
        assert_eq!(session.state().await, SessionState::Disconnected);

        session.set_sampling_interval(20).await.unwrap();
        assert_eq!(session.state().await, SessionState::Connected);
        assert_eq!(sim.calls()[0], RecordedCall::Connect);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_are_idempotent() {
        let sim = SimulatedSpectrometer::new(NodeMap::default(), 3);
        let session = session_with(&sim);

        assert_eq!(session.connect().await.unwrap(), Transition::Applied);
        assert_eq!(session.connect().await.unwrap(), Transition::Ignored);
        assert_eq!(session.disconnect().await.unwrap(), Transition::Applied);
        assert_eq!(session.disconnect().await.unwrap(), Transition::Ignored);
        assert_eq!(
            sim.calls(),
            vec![RecordedCall::Connect, RecordedCall::Disconnect]
        );
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let sim = SimulatedSpectrometer::new(NodeMap::default(), 3);
        let session = session_with(&sim);

        session.start_experiment("exp", "tmpl", false).await.unwrap();
        let err = session
            .start_experiment("exp2", "tmpl", false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaqError::IllegalTransition {
                state: "running",
                ..
            }
        ));
        assert_eq!(sim.method_calls(), vec![NodeMap::default().start_experiment]);
    }

    #[tokio::test]
    async fn test_failed_call_keeps_state() {
        let sim = SimulatedSpectrometer::new(NodeMap::default(), 3);
        let session = session_with(&sim);
        session.start_experiment("exp", "tmpl", false).await.unwrap();

        sim.fail_method(&NodeMap::default().pause);
        assert!(matches!(
            session.pause_experiment().await,
            Err(DaqError::HardwareComm(_))
        ));
        assert_eq!(session.state().await, SessionState::Running);
    }

    #[tokio::test]
    async fn test_background_spectrum_uses_axis() {
        let sim = SimulatedSpectrometer::new(NodeMap::default(), 3);
        let session = session_with(&sim);

        let background = session.get_last_background_spectrum().await.unwrap();
        assert_eq!(background.kind, SpectrumKind::Background);
        assert!(background.is_aligned());
        assert_eq!(session.cached_background().await, Some(background));
    }

    #[tokio::test]
    async fn test_resubscribe_is_ignored() {
        let sim = SimulatedSpectrometer::new(NodeMap::default(), 3);
        let session = session_with(&sim);
        assert_eq!(session.subscribe_raw().await.unwrap(), Transition::Applied);
        assert_eq!(session.subscribe_raw().await.unwrap(), Transition::Ignored);
        assert_eq!(
            session.subscribe_treated().await.unwrap(),
            Transition::Applied
        );
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_interval_drift_is_logged() {
        let sim = SimulatedSpectrometer::new(NodeMap::default(), 3);
        let session = session_with(&sim);
        session.set_sampling_interval(30).await.unwrap();
        sim.override_sampling_interval(60);

        let actual = session.get_current_sampling_interval().await.unwrap();
        assert_eq!(actual, 60.0);
        assert_eq!(session.sampling_interval().await, Some(30));
        assert!(logs_contain("differs from the requested value"));
    }

    #[tokio::test]
    async fn test_shutdown_without_experiment_just_disconnects() {
        let sim = SimulatedSpectrometer::new(NodeMap::default(), 3);
        let session = session_with(&sim);
        session.connect().await.unwrap();
        session.shutdown().await.unwrap();
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert!(sim.method_calls().is_empty());
    }
}
