//! Experiment orchestrator
//!
//! Runs the fixed monitoring protocol against a [`SyringePump`] and a
//! [`SpectrometerSession`]:
//!
//! 1. refuse to start if the instrument already holds spectra under this name
//! 2. operator setup check (and the optional mix changeover question)
//! 3. start the stirrer if one is attached, then prime the line with solvent
//!    to waste
//! 4. solvent baseline in the flow cell, then return it with carry-over
//! 5. first sample acquisition
//! 6. sampling loop until the run time budget is used up, or until the
//!    single extended window after a mix changeover
//! 7. stop the instrument experiment
//! 8. flush the flow cell with every cleaning reservoir
//! 9. shut every device down, whatever happened before
//!
//! Acquisition is paused whenever liquid moves and resumed only once it is
//! at rest in the flow cell, so every spectrum belongs to exactly one sample.

use crate::config::ExperimentConfig;
use crate::error::{AppResult, DaqError};
use crate::experiment::prompt::{Answer, OperatorPrompt};
use crate::experiment::recorder::{RecorderHandle, SpectrumRecorder};
use crate::experiment::timeline::{LoopClock, Stage, StageRecord, Timeline};
use crate::hardware::capabilities::StirrerDriver;
use crate::instrument::session::SpectrometerSession;
use crate::pump::{SyringePump, TransferRequest};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

const SOLVENT_LINE_QUESTION: &str = "Is the solvent line lifted above the liquid level?";
const SAMPLE_FLASK_QUESTION: &str = "Is the sample flask connected to the pump?";
const MIX_PLAN_QUESTION: &str = "Will the sample vial be changed to a mix at the midpoint?";
const MIX_SWAP_QUESTION: &str = "Midpoint reached: swap the sample vial for the mix now. Continue?";

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub experiment_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageRecord>,
    /// Sampling loop iterations, the first sample excluded
    pub sample_iterations: usize,
    pub mix_required: bool,
    pub mix_triggered: bool,
    pub transferred_ml: f64,
    pub raw_spectra: u64,
    pub treated_spectra: u64,
    pub dropped_spectra: u64,
    pub recorded_files: usize,
}

#[derive(Debug)]
struct RunProgress {
    timeline: Timeline,
    sample_iterations: usize,
    mix_required: bool,
    mix_triggered: bool,
    transferred_ml: f64,
}

pub struct ExperimentOrchestrator {
    config: ExperimentConfig,
    pump: Arc<SyringePump>,
    session: Arc<SpectrometerSession>,
    prompt: Box<dyn OperatorPrompt>,
    stirrer: Option<Box<dyn StirrerDriver>>,
}

impl ExperimentOrchestrator {
    pub fn new(
        config: ExperimentConfig,
        pump: Arc<SyringePump>,
        session: Arc<SpectrometerSession>,
        prompt: Box<dyn OperatorPrompt>,
    ) -> Self {
        Self {
            config,
            pump,
            session,
            prompt,
            stirrer: None,
        }
    }

    /// Stir the sample flask at `stirrer.stir_rate` for the whole run
    pub fn with_stirrer(mut self, stirrer: Box<dyn StirrerDriver>) -> Self {
        self.stirrer = Some(stirrer);
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Execute the whole protocol
    ///
    /// Every device is shut down before this returns, on success and on
    /// failure alike. A failure during the protocol is returned as is, with
    /// teardown problems only logged; after a successful protocol, teardown
    /// problems are returned as [`DaqError::ShutdownFailed`].
    pub async fn run(&mut self) -> AppResult<RunSummary> {
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            experiment = %self.config.run.experiment_name,
            "Starting experiment run"
        );

        let mut progress = RunProgress {
            timeline: Timeline::start(),
            sample_iterations: 0,
            mix_required: false,
            mix_triggered: false,
            transferred_ml: 0.0,
        };
        let recorders = self.start_recorders();

        let outcome = self.execute(&mut progress).await;

        progress.timeline.enter(Stage::ShutDown);
        let teardown = self.teardown().await;
        let recorded_files = finish_recorders(recorders).await;

        match (outcome, teardown) {
            (Err(err), Err(teardown_errors)) => {
                error!(
                    error = %err,
                    teardown_failures = teardown_errors.len(),
                    "Run failed and teardown was incomplete"
                );
                Err(err)
            }
            (Err(err), Ok(())) => {
                error!(error = %err, "Run failed");
                Err(err)
            }
            (Ok(()), Err(teardown_errors)) => Err(DaqError::ShutdownFailed(teardown_errors)),
            (Ok(()), Ok(())) => {
                let raw = self.session.raw_queue();
                let treated = self.session.treated_queue();
                let summary = RunSummary {
                    run_id,
                    experiment_name: self.config.run.experiment_name.clone(),
                    started_at: progress.timeline.started_at(),
                    finished_at: Utc::now(),
                    stages: progress.timeline.stages().to_vec(),
                    sample_iterations: progress.sample_iterations,
                    mix_required: progress.mix_required,
                    mix_triggered: progress.mix_triggered,
                    transferred_ml: progress.transferred_ml,
                    raw_spectra: raw.pushed_count(),
                    treated_spectra: treated.pushed_count(),
                    dropped_spectra: raw.dropped_count() + treated.dropped_count(),
                    recorded_files,
                };
                self.write_summary(&summary)?;
                info!(
                    %run_id,
                    iterations = summary.sample_iterations,
                    transferred_ml = summary.transferred_ml,
                    "Experiment run complete"
                );
                Ok(summary)
            }
        }
    }

    async fn execute(&mut self, progress: &mut RunProgress) -> AppResult<()> {
        let ports = self.config.ports.clone();
        let volumes = self.config.volumes.clone();
        let speeds = self.config.speeds.clone();
        let cleaning = self.config.cleaning.clone();
        let run = self.config.run.clone();

        progress.timeline.enter(Stage::SetupCheck);
        self.check_duplicate()?;
        self.confirm(SOLVENT_LINE_QUESTION).await?;
        self.confirm(SAMPLE_FLASK_QUESTION).await?;
        progress.mix_required = self.ask_mix_plan().await?;

        progress.timeline.enter(Stage::Priming);
        self.start_stirrer().await?;
        self.transfer(
            progress,
            ports.solvent,
            ports.waste,
            volumes.prime_ml,
            speeds.prime_ml_s,
        )
        .await?;

        progress.timeline.enter(Stage::Baseline);
        self.transfer(
            progress,
            ports.solvent,
            ports.ir,
            volumes.solvent_sample_ml,
            speeds.solvent_ml_s,
        )
        .await?;
        if let Some(seconds) = run.sampling_interval_s {
            self.session.set_sampling_interval(seconds).await?;
            let actual = self.session.get_current_sampling_interval().await?;
            info!(requested = seconds, actual, "Instrument sampling interval");
        }
        let _ = self
            .session
            .start_experiment(
                run.spectra_location(),
                &run.template_name,
                run.collect_background,
            )
            .await?;
        let _ = self.session.subscribe_raw().await?;
        let _ = self.session.subscribe_treated().await?;
        sleep(secs(run.solvent_spectrum_time_s)).await;
        let _ = self.session.pause_experiment().await?;
        if run.collect_background {
            self.save_background().await;
        }
        self.transfer(
            progress,
            ports.ir,
            ports.solvent,
            volumes.carryover_factor * volumes.solvent_sample_ml,
            speeds.solvent_ml_s,
        )
        .await?;

        progress.timeline.enter(Stage::FirstSample);
        self.acquire(secs(run.sample_spectrum_time_s)).await?;

        progress.timeline.enter(Stage::SamplingLoop);
        let clock = LoopClock::start(secs(run.experiment_run_time_s));
        while !clock.expired() {
            let mut window = secs(run.sample_spectrum_time_s);
            let mut mix_window = false;
            if progress.mix_required && !progress.mix_triggered && clock.past_midpoint() {
                match self.prompt.ask(MIX_SWAP_QUESTION).await? {
                    Answer::Yes => {
                        info!("Mix changeover confirmed, measuring the mix once");
                        progress.mix_triggered = true;
                        mix_window = true;
                        window = secs(run.mix_spectrum_time_s);
                    }
                    answer => {
                        warn!(?answer, "Mix changeover declined, ending sampling loop");
                        break;
                    }
                }
            }

            self.pump.switch(ports.ir).await?;
            self.pump
                .move_to(volumes.sample_ml, speeds.sample_ml_s)
                .await?;
            self.acquire(window).await?;
            self.pump.move_to(0.0, speeds.sample_ml_s).await?;
            progress.transferred_ml += volumes.sample_ml;
            progress.sample_iterations += 1;
            info!(
                iteration = progress.sample_iterations,
                elapsed_s = clock.elapsed().as_secs(),
                "Sample measured"
            );
            if mix_window {
                info!("Mix measured, ending sampling loop");
                break;
            }
        }

        progress.timeline.enter(Stage::Stopping);
        let _ = self.session.stop_experiment().await?;

        progress.timeline.enter(Stage::Cleaning);
        for (port, volume_ml) in [
            (ports.wet_solvent, cleaning.wet_solvent_ml),
            (ports.water, cleaning.water_ml),
            (ports.solvent, cleaning.solvent_ml),
            (ports.air, cleaning.air_ml),
        ] {
            self.transfer(progress, port, ports.ir, volume_ml, speeds.clean_ml_s)
                .await?;
        }
        Ok(())
    }

    async fn start_stirrer(&self) -> AppResult<()> {
        let Some(stirrer) = &self.stirrer else {
            return Ok(());
        };
        let rpm = self.config.stirrer.stir_rate;
        stirrer.set_target_rate(rpm).await?;
        stirrer.start().await?;
        info!(stirrer = stirrer.name(), rpm, "Stirring started");
        Ok(())
    }

    /// Resume, acquire for `window`, pause
    async fn acquire(&self, window: Duration) -> AppResult<()> {
        let _ = self.session.resume_experiment().await?;
        sleep(window).await;
        let _ = self.session.pause_experiment().await?;
        Ok(())
    }

    async fn transfer(
        &self,
        progress: &mut RunProgress,
        from_port: u8,
        to_port: u8,
        volume_ml: f64,
        speed_ml_s: f64,
    ) -> AppResult<()> {
        let request = TransferRequest::new(from_port, to_port, volume_ml, speed_ml_s);
        let report = self.pump.transfer(&request).await?;
        progress.transferred_ml += report.moved_ml();
        Ok(())
    }

    fn check_duplicate(&self) -> AppResult<()> {
        let Some(dir) = &self.config.run.spectra_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.iCIR", self.config.run.experiment_name));
        if path.exists() {
            return Err(DaqError::DuplicateExperiment(path));
        }
        Ok(())
    }

    /// Ask until the operator says yes; `Exit` aborts the run
    async fn confirm(&mut self, question: &str) -> AppResult<()> {
        loop {
            match self.prompt.ask(question).await? {
                Answer::Yes => return Ok(()),
                Answer::No => info!(question, "Waiting for operator"),
                Answer::Exit => return Err(DaqError::Aborted(question.to_string())),
            }
        }
    }

    async fn ask_mix_plan(&mut self) -> AppResult<bool> {
        if !self.config.mix_changeover.ask_operator {
            return Ok(self.config.mix_changeover.required);
        }
        match self.prompt.ask(MIX_PLAN_QUESTION).await? {
            Answer::Yes => Ok(true),
            Answer::No => Ok(false),
            Answer::Exit => Err(DaqError::Aborted(MIX_PLAN_QUESTION.to_string())),
        }
    }

    async fn save_background(&self) {
        let background = match self.session.get_last_background_spectrum().await {
            Ok(background) => background,
            Err(err) => {
                warn!(error = %err, "Could not fetch background spectrum");
                return;
            }
        };
        info!(points = background.intensities.len(), "Background spectrum fetched");
        if let Some(dir) = &self.config.run.output_dir {
            let recorder = SpectrumRecorder::new(dir, &self.config.run.experiment_name);
            if let Err(err) = recorder.store(background).await {
                warn!(error = %err, "Could not write background spectrum");
            }
        }
    }

    fn start_recorders(&self) -> Vec<RecorderHandle> {
        let Some(dir) = &self.config.run.output_dir else {
            return Vec::new();
        };
        let recorder = SpectrumRecorder::new(dir, &self.config.run.experiment_name);
        vec![
            recorder.spawn(self.session.raw_queue()),
            recorder.spawn(self.session.treated_queue()),
        ]
    }

    async fn teardown(&self) -> Result<(), Vec<DaqError>> {
        let mut errors = Vec::new();
        if let Err(err) = self.session.shutdown().await {
            error!(error = %err, "Spectrometer shutdown failed");
            errors.push(err);
        }
        if let Err(err) = self.pump.shutdown().await {
            error!(error = %err, "Pump shutdown failed");
            errors.push(err);
        }
        if let Some(stirrer) = &self.stirrer {
            let stopped = stirrer.stop().await;
            let disconnected = stirrer.disconnect().await;
            if let Err(err) = stopped.and(disconnected) {
                error!(error = %err, "Stirrer shutdown failed");
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn write_summary(&self, summary: &RunSummary) -> AppResult<()> {
        let Some(dir) = &self.config.run.output_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let path: PathBuf = dir.join(format!("{}_summary.json", summary.experiment_name));
        let file = std::fs::File::create(&path)?;
        serde_json::to_writer_pretty(file, summary).map_err(std::io::Error::from)?;
        info!(path = %path.display(), "Run summary written");
        Ok(())
    }
}

async fn finish_recorders(recorders: Vec<RecorderHandle>) -> usize {
    let mut written = 0;
    for recorder in recorders {
        match recorder.finish().await {
            Ok(count) => written += count,
            Err(err) => warn!(error = %err, "Spectrum recorder failed"),
        }
    }
    written
}

fn secs(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::prompt::ScriptedPrompt;
    use crate::hardware::mock::MockSyringeDriver;
    use crate::instrument::nodes::NodeMap;
    use crate::instrument::simulated::SimulatedSpectrometer;
    use crate::pump::ResolutionMode;

    fn short_config() -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.run.experiment_run_time_s = 120.0;
        config.run.sample_spectrum_time_s = 30.0;
        config.mix_changeover.ask_operator = false;
        config
    }

    fn build(
        config: ExperimentConfig,
        answers: Vec<Answer>,
    ) -> (ExperimentOrchestrator, MockSyringeDriver, SimulatedSpectrometer) {
        let driver = MockSyringeDriver::new();
        let sim = SimulatedSpectrometer::new(NodeMap::default(), 4);
        let pump = SyringePump::new(
            Box::new(driver.clone()),
            config.pump.valve_count,
            config.pump.syringe_capacity_ml,
            ResolutionMode::Standard,
        );
        let session = SpectrometerSession::new(
            Box::new(sim.clone()),
            NodeMap::default(),
            vec![1.0, 2.0, 3.0, 4.0].into(),
            64,
            Duration::from_millis(100),
        );
        let orchestrator = ExperimentOrchestrator::new(
            config,
            Arc::new(pump),
            Arc::new(session),
            Box::new(ScriptedPrompt::new(answers)),
        );
        (orchestrator, driver, sim)
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_no_reprompts_until_yes() {
        let (mut orchestrator, _driver, _sim) = build(
            short_config(),
            vec![Answer::No, Answer::Yes, Answer::Yes],
        );
        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.sample_iterations, 4);
        assert!(!summary.mix_required);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_at_setup_aborts_without_motion() {
        let (mut orchestrator, driver, sim) = build(short_config(), vec![Answer::Exit]);
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, DaqError::Aborted(_)));
        assert_eq!(
            driver.commands().await,
            vec![crate::hardware::mock::DriverCommand::Disconnect]
        );
        assert!(sim.method_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stages_in_order() {
        let (mut orchestrator, _driver, _sim) =
            build(short_config(), vec![Answer::Yes, Answer::Yes]);
        let summary = orchestrator.run().await.unwrap();
        let stages: Vec<_> = summary.stages.iter().map(|s| s.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::SetupCheck,
                Stage::Priming,
                Stage::Baseline,
                Stage::FirstSample,
                Stage::SamplingLoop,
                Stage::Stopping,
                Stage::Cleaning,
                Stage::ShutDown,
            ]
        );
    }
}
