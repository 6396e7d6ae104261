//! Experiment orchestration
//!
//! - `orchestrator`: the fixed monitoring protocol
//! - `timeline`: stage tracking and the sampling-loop clock
//! - `prompt`: operator confirmations
//! - `recorder`: per-scan CSV output
//!
//! # Example
//!
//! ```rust,ignore
//! use reactir_daq::experiment::{ExperimentOrchestrator, ConsolePrompt};
//!
//! let mut orchestrator = ExperimentOrchestrator::new(config, pump, session, Box::new(ConsolePrompt));
//! let summary = orchestrator.run().await?;
//! println!("{} samples measured", summary.sample_iterations);
//! ```

pub mod orchestrator;
pub mod prompt;
pub mod recorder;
pub mod timeline;

pub use orchestrator::{ExperimentOrchestrator, RunSummary};
pub use prompt::{AlwaysYes, Answer, ConsolePrompt, OperatorPrompt, ScriptedPrompt};
pub use recorder::{RecorderHandle, SpectrumRecorder};
pub use timeline::{LoopClock, Stage, StageRecord, Timeline};
