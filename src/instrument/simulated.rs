//! Simulated spectrometer server
//!
//! Implements [`NodeTransport`] in-process. It answers the same methods and
//! variables as the real controller and, while an experiment is acquiring,
//! publishes a synthetic raw and treated spectrum every sampling interval.
//! Every request is recorded so tests can assert on the exact call sequence.
//!
//! Acquisition timing uses `tokio::time`, so runs on a paused clock finish
//! instantly.

use crate::error::{AppResult, DaqError};
use crate::instrument::nodes::NodeMap;
use crate::instrument::transport::{MethodArg, NodeTransport, NodeValue, Notification};
use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Sampling interval the controller starts with
const DEFAULT_SAMPLING_INTERVAL_S: u32 = 15;

/// One request received by the simulator
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Connect,
    Disconnect,
    Method { method: String, args: Vec<MethodArg> },
    Read(String),
    Subscribe(String),
}

struct SimState {
    connected: bool,
    experiment: Option<String>,
    acquiring: bool,
    sampling_interval_s: u32,
    scans: u64,
    last_raw: Option<Vec<f64>>,
    last_treated: Option<Vec<f64>>,
    background: Vec<f64>,
    subscribers: Vec<(String, mpsc::Sender<Notification>)>,
    ticker: Option<JoinHandle<()>>,
    calls: Vec<RecordedCall>,
    failing_method: Option<String>,
}

/// In-process stand-in for the spectrometer controller
///
/// Clones share state: hand one to the session and keep one for assertions.
#[derive(Clone)]
pub struct SimulatedSpectrometer {
    nodes: NodeMap,
    points: usize,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSpectrometer {
    /// Simulator producing spectra of `points` values
    pub fn new(nodes: NodeMap, points: usize) -> Self {
        Self {
            nodes,
            points,
            state: Arc::new(Mutex::new(SimState {
                connected: false,
                experiment: None,
                acquiring: false,
                sampling_interval_s: DEFAULT_SAMPLING_INTERVAL_S,
                scans: 0,
                last_raw: None,
                last_treated: None,
                background: synth_background(points),
                subscribers: Vec::new(),
                ticker: None,
                calls: Vec::new(),
                failing_method: None,
            })),
        }
    }

    /// Every request received so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Method node ids called so far, in order
    pub fn method_calls(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                RecordedCall::Method { method, .. } => Some(method.clone()),
                _ => None,
            })
            .collect()
    }

    /// Make every call of `method` fail with a communication error
    pub fn fail_method(&self, method: &str) {
        self.lock().failing_method = Some(method.to_string());
    }

    pub fn clear_failure(&self) {
        self.lock().failing_method = None;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_acquiring(&self) -> bool {
        self.lock().acquiring
    }

    /// Name of the experiment started last, while it is active
    pub fn experiment(&self) -> Option<String> {
        self.lock().experiment.clone()
    }

    pub fn sampling_interval_s(&self) -> u32 {
        self.lock().sampling_interval_s
    }

    /// Change the interval on the instrument side, as an operator at the
    /// instrument PC would
    pub fn override_sampling_interval(&self, seconds: u32) {
        self.lock().sampling_interval_s = seconds;
    }

    /// Scans published since creation
    pub fn scan_count(&self) -> u64 {
        self.lock().scans
    }

    /// Publish `values` on `node` to every subscriber right now
    ///
    /// Returns the number of subscribers that accepted the notification.
    pub fn emit(&self, node: &str, values: Vec<f64>) -> usize {
        let state = self.lock();
        publish(&state.subscribers, node, &values)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        lock_state(&self.state)
    }

    fn restart_ticker(&self, state: &mut SimState) {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        let period = Duration::from_secs(u64::from(state.sampling_interval_s.max(1)));
        let shared = self.state.clone();
        let raw_node = self.nodes.raw_spectra.clone();
        let treated_node = self.nodes.treated_spectra.clone();
        let points = self.points;

        state.ticker = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let mut state = lock_state(&shared);
                if !state.acquiring {
                    continue;
                }
                let scan = state.scans;
                let raw = synth_raw(points, scan);
                let treated = synth_treated(&raw, &state.background);
                publish(&state.subscribers, &raw_node, &raw);
                publish(&state.subscribers, &treated_node, &treated);
                state.last_raw = Some(raw);
                state.last_treated = Some(treated);
                state.scans += 1;
                trace!(scan, "Simulated scan published");
            }
        }));
    }

    fn check_connected(state: &SimState) -> AppResult<()> {
        if state.connected {
            Ok(())
        } else {
            Err(DaqError::comm("simulated spectrometer: not connected"))
        }
    }
}

#[async_trait]
impl NodeTransport for SimulatedSpectrometer {
    async fn connect(&mut self) -> AppResult<()> {
        let mut state = self.lock();
        state.calls.push(RecordedCall::Connect);
        state.connected = true;
        if state.experiment.is_some() && state.ticker.is_none() {
            self.restart_ticker(&mut state);
        }
        debug!("Simulated spectrometer connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        let mut state = self.lock();
        state.calls.push(RecordedCall::Disconnect);
        state.connected = false;
        state.subscribers.clear();
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        debug!("Simulated spectrometer disconnected");
        Ok(())
    }

    async fn call_method(
        &mut self,
        parent: &str,
        method: &str,
        args: Vec<MethodArg>,
    ) -> AppResult<()> {
        let mut state = self.lock();
        Self::check_connected(&state)?;
        state.calls.push(RecordedCall::Method {
            method: method.to_string(),
            args: args.clone(),
        });

        if state.failing_method.as_deref() == Some(method) {
            return Err(DaqError::comm(format!(
                "simulated spectrometer: {} failed",
                method
            )));
        }
        if parent != self.nodes.methods {
            return Err(DaqError::comm(format!(
                "simulated spectrometer: BadNodeIdUnknown for parent {}",
                parent
            )));
        }

        if method == self.nodes.start_experiment {
            let name = match args.first() {
                Some(MethodArg::Text(name)) => name.clone(),
                _ => return Err(DaqError::comm("Start Experiment: missing experiment name")),
            };
            if matches!(args.get(2), Some(MethodArg::Bool(true))) {
                state.background = synth_background(self.points);
            }
            state.experiment = Some(name);
            state.acquiring = true;
            self.restart_ticker(&mut state);
        } else if method == self.nodes.pause {
            state.acquiring = false;
        } else if method == self.nodes.resume {
            state.acquiring = state.experiment.is_some();
        } else if method == self.nodes.stop {
            state.acquiring = false;
            state.experiment = None;
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
            }
        } else if method == self.nodes.set_sampling_interval {
            match args.first() {
                Some(MethodArg::Int(seconds)) if *seconds > 0 => {
                    state.sampling_interval_s = *seconds as u32;
                }
                _ => {
                    return Err(DaqError::comm(
                        "SetSamplingInterval: BadInvalidArgument",
                    ))
                }
            }
            if state.experiment.is_some() {
                self.restart_ticker(&mut state);
            }
        } else {
            return Err(DaqError::comm(format!(
                "simulated spectrometer: BadMethodInvalid {}",
                method
            )));
        }
        Ok(())
    }

    async fn read_value(&mut self, node: &str) -> AppResult<NodeValue> {
        let mut state = self.lock();
        Self::check_connected(&state)?;
        state.calls.push(RecordedCall::Read(node.to_string()));

        let value = if node == self.nodes.current_sampling_interval {
            NodeValue::Scalar(f64::from(state.sampling_interval_s))
        } else if node == self.nodes.background_spectra {
            NodeValue::Series(state.background.clone())
        } else if node == self.nodes.raw_spectra {
            state
                .last_raw
                .clone()
                .map_or(NodeValue::Empty, NodeValue::Series)
        } else if node == self.nodes.treated_spectra {
            state
                .last_treated
                .clone()
                .map_or(NodeValue::Empty, NodeValue::Series)
        } else {
            return Err(DaqError::comm(format!(
                "simulated spectrometer: BadNodeIdUnknown {}",
                node
            )));
        };
        Ok(value)
    }

    async fn subscribe(
        &mut self,
        node: &str,
        _publishing_interval: Duration,
        sink: mpsc::Sender<Notification>,
    ) -> AppResult<()> {
        let mut state = self.lock();
        Self::check_connected(&state)?;
        state.calls.push(RecordedCall::Subscribe(node.to_string()));
        state.subscribers.push((node.to_string(), sink));
        Ok(())
    }
}

fn lock_state(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn publish(
    subscribers: &[(String, mpsc::Sender<Notification>)],
    node: &str,
    values: &[f64],
) -> usize {
    subscribers
        .iter()
        .filter(|(subscribed, _)| subscribed == node)
        .filter(|(_, sink)| {
            sink.try_send(Notification {
                node: node.to_string(),
                value: NodeValue::Series(values.to_vec()),
            })
            .is_ok()
        })
        .count()
}

fn synth_background(points: usize) -> Vec<f64> {
    let mut rng = rand::thread_rng();
    (0..points)
        .map(|i| {
            let x = i as f64 / points.max(1) as f64;
            0.8 + 0.2 * (std::f64::consts::PI * x).sin() + rng.gen_range(-0.002..0.002)
        })
        .collect()
}

/// Single-beam scan with two absorption bands that grow as the run goes on
fn synth_raw(points: usize, scan: u64) -> Vec<f64> {
    let mut rng = rand::thread_rng();
    let growth = 1.0 - (-(scan as f64) / 40.0).exp();
    (0..points)
        .map(|i| {
            let x = i as f64 / points.max(1) as f64;
            let band = 0.3 * gaussian(x, 0.35, 0.02) + 0.2 * growth * gaussian(x, 0.7, 0.03);
            let beam = 0.8 + 0.2 * (std::f64::consts::PI * x).sin();
            beam * (1.0 - band) + rng.gen_range(-0.002..0.002)
        })
        .collect()
}

/// Absorbance relative to the background
fn synth_treated(raw: &[f64], background: &[f64]) -> Vec<f64> {
    raw.iter()
        .zip(background)
        .map(|(sample, reference)| {
            if *sample > 0.0 && *reference > 0.0 {
                -(sample / reference).log10()
            } else {
                0.0
            }
        })
        .collect()
}

fn gaussian(x: f64, centre: f64, width: f64) -> f64 {
    (-((x - centre) / width).powi(2) / 2.0).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_require_connection() {
        let mut sim = SimulatedSpectrometer::new(NodeMap::default(), 8);
        let nodes = NodeMap::default();
        assert!(sim
            .call_method(&nodes.methods, &nodes.pause, Vec::new())
            .await
            .is_err());
        sim.connect().await.unwrap();
        sim.call_method(&nodes.methods, &nodes.pause, Vec::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_parent_rejected() {
        let mut sim = SimulatedSpectrometer::new(NodeMap::default(), 8);
        let nodes = NodeMap::default();
        sim.connect().await.unwrap();
        assert!(sim
            .call_method("ns=2;s=Elsewhere", &nodes.pause, Vec::new())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_publishes_every_interval() {
        let mut sim = SimulatedSpectrometer::new(NodeMap::default(), 8);
        let nodes = NodeMap::default();
        let (tx, mut rx) = mpsc::channel(16);
        sim.connect().await.unwrap();
        sim.subscribe(&nodes.raw_spectra, Duration::from_millis(100), tx)
            .await
            .unwrap();
        sim.call_method(
            &nodes.methods,
            &nodes.start_experiment,
            vec![
                MethodArg::Text("exp".into()),
                MethodArg::Text("tmpl".into()),
                MethodArg::Bool(false),
            ],
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(46)).await;
        let mut received = 0;
        while let Ok(notification) = rx.try_recv() {
            assert_eq!(notification.node, nodes.raw_spectra);
            assert!(matches!(notification.value, NodeValue::Series(ref v) if v.len() == 8));
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_acquisition_is_silent() {
        let mut sim = SimulatedSpectrometer::new(NodeMap::default(), 4);
        let nodes = NodeMap::default();
        sim.connect().await.unwrap();
        sim.call_method(
            &nodes.methods,
            &nodes.start_experiment,
            vec![
                MethodArg::Text("exp".into()),
                MethodArg::Text("tmpl".into()),
                MethodArg::Bool(true),
            ],
        )
        .await
        .unwrap();
        sim.call_method(&nodes.methods, &nodes.pause, Vec::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sim.scan_count(), 0);
    }

    #[tokio::test]
    async fn test_emit_reaches_matching_subscribers_only() {
        let mut sim = SimulatedSpectrometer::new(NodeMap::default(), 4);
        let nodes = NodeMap::default();
        let (raw_tx, mut raw_rx) = mpsc::channel(4);
        let (treated_tx, mut treated_rx) = mpsc::channel(4);
        sim.connect().await.unwrap();
        sim.subscribe(&nodes.raw_spectra, Duration::ZERO, raw_tx)
            .await
            .unwrap();
        sim.subscribe(&nodes.treated_spectra, Duration::ZERO, treated_tx)
            .await
            .unwrap();

        assert_eq!(sim.emit(&nodes.raw_spectra, vec![1.0; 4]), 1);
        assert!(raw_rx.try_recv().is_ok());
        assert!(treated_rx.try_recv().is_err());
    }

    #[test]
    fn test_treated_is_absorbance() {
        let treated = synth_treated(&[0.1, 1.0], &[1.0, 1.0]);
        assert!((treated[0] - 1.0).abs() < 1e-12);
        assert!(treated[1].abs() < 1e-12);
    }
}
