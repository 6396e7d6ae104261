//! Per-scan CSV recorder
//!
//! Each scan becomes one file `<root>/<kind>/<experiment>_<seq>.csv`:
//!
//! ```text
//! Wavenumbercm-1,2024-05-01 14:03:12
//! 649.9,0.0123
//! 651.8,0.0131
//! ...
//! ```
//!
//! The recorder only drains queues; it never blocks the notification side.

use crate::error::{AppResult, DaqError};
use crate::instrument::queue::SpectrumQueue;
use crate::instrument::spectrum::{Spectrum, WAVENUMBER_COLUMN};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct SpectrumRecorder {
    root: PathBuf,
    experiment: String,
}

impl SpectrumRecorder {
    pub fn new(root: impl Into<PathBuf>, experiment: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            experiment: experiment.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path the scan will be written to
    pub fn path_for(&self, spectrum: &Spectrum) -> PathBuf {
        self.root.join(spectrum.kind.as_str()).join(format!(
            "{}_{}.csv",
            self.experiment, spectrum.sequence
        ))
    }

    /// Write one scan
    pub fn write(&self, spectrum: &Spectrum) -> AppResult<PathBuf> {
        let path = self.path_for(spectrum);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !spectrum.is_aligned() {
            warn!(
                path = %path.display(),
                points = spectrum.intensities.len(),
                axis = spectrum.wavenumbers.len(),
                "Writing misaligned spectrum, extra points are dropped"
            );
        }

        let mut writer = csv::Writer::from_path(&path)?;
        let label = spectrum.timestamp.format(TIMESTAMP_FORMAT).to_string();
        writer.write_record([WAVENUMBER_COLUMN, label.as_str()])?;
        for (wavenumber, intensity) in spectrum.points() {
            writer.write_record([wavenumber.to_string(), intensity.to_string()])?;
        }
        writer.flush()?;
        debug!(path = %path.display(), "Spectrum written");
        Ok(path)
    }

    /// Write one scan on the blocking pool
    pub async fn store(&self, spectrum: Spectrum) -> AppResult<PathBuf> {
        let recorder = self.clone();
        tokio::task::spawn_blocking(move || recorder.write(&spectrum))
            .await
            .map_err(|e| DaqError::Io(std::io::Error::other(e.to_string())))?
    }

    /// Drain `queue` in the background until [`RecorderHandle::finish`]
    pub fn spawn(&self, queue: SpectrumQueue) -> RecorderHandle {
        let (stop, mut stopped) = watch::channel(false);
        let recorder = self.clone();

        let task = tokio::spawn(async move {
            let mut written = 0usize;
            loop {
                tokio::select! {
                    spectrum = queue.recv() => {
                        recorder.store(spectrum).await?;
                        written += 1;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            for spectrum in queue.drain() {
                recorder.store(spectrum).await?;
                written += 1;
            }
            info!(
                feed = %queue.kind(),
                written,
                dropped = queue.dropped_count(),
                "Recorder finished"
            );
            Ok::<_, DaqError>(written)
        });

        RecorderHandle { stop, task }
    }
}

/// Running recorder task
pub struct RecorderHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<AppResult<usize>>,
}

impl RecorderHandle {
    /// Flush what is queued, stop, and return the number of files written
    pub async fn finish(self) -> AppResult<usize> {
        // The task may already have exited on a write error.
        let _ = self.stop.send(true);
        self.task
            .await
            .map_err(|e| DaqError::Io(std::io::Error::other(e.to_string())))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::spectrum::{read_wavenumbers, SpectrumKind};

    fn spectrum(seq: u64) -> Spectrum {
        Spectrum::new(
            SpectrumKind::Treated,
            seq,
            vec![1000.0, 1002.0].into(),
            vec![0.5, 0.25],
        )
    }

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SpectrumRecorder::new(dir.path(), "run1");
        let path = recorder.write(&spectrum(3)).unwrap();
        assert_eq!(path, dir.path().join("treated").join("run1_3.csv"));

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("Wavenumbercm-1,"));
        assert_eq!(lines.next(), Some("1000,0.5"));
        assert_eq!(lines.next(), Some("1002,0.25"));

        // The axis column reads back with the same loader as the reference table.
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let axis = read_wavenumbers(&mut reader, "scan").unwrap();
        assert_eq!(&axis[..], &[1000.0, 1002.0]);
    }

    #[tokio::test]
    async fn test_spawned_recorder_flushes_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SpectrumRecorder::new(dir.path(), "run1");
        let queue = SpectrumQueue::new(SpectrumKind::Treated, 8);
        let handle = recorder.spawn(queue.clone());

        for seq in 0..4 {
            queue.push(spectrum(seq));
        }
        assert_eq!(handle.finish().await.unwrap(), 4);
        assert!(dir.path().join("treated").join("run1_3.csv").exists());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_store_writes_from_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SpectrumRecorder::new(dir.path(), "run1");
        let path = recorder.store(spectrum(7)).await.unwrap();
        assert_eq!(path, dir.path().join("treated").join("run1_7.csv"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_write_error_surfaces_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("not_a_dir");
        std::fs::write(&blocked, b"file").unwrap();
        let recorder = SpectrumRecorder::new(&blocked, "run1");
        let queue = SpectrumQueue::new(SpectrumKind::Treated, 8);
        let handle = recorder.spawn(queue.clone());

        queue.push(spectrum(0));
        assert!(handle.finish().await.is_err());
    }
}
