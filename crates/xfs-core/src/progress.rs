use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Preparing,
    Extracting,
    Scoring,
    Selecting,
    Materializing,
    Finished,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preparing => "preparing",
            Self::Extracting => "extracting",
            Self::Scoring => "scoring",
            Self::Selecting => "selecting",
            Self::Materializing => "materializing",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub phase: RunPhase,
    /// `None` while the amount of remaining work is unknown.
    pub percent: Option<f32>,
    pub artifact: Option<String>,
}

impl ProgressEvent {
    pub fn phase(phase: RunPhase) -> Self {
        Self {
            phase,
            percent: None,
            artifact: None,
        }
    }

    pub fn with_percent(mut self, percent: f32) -> Self {
        self.percent = Some(percent.clamp(0.0, 100.0));
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }
}

/// Receiver of incremental progress; called from worker threads.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events to `tracing` at info level.
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, event: ProgressEvent) {
        tracing::info!(
            phase = %event.phase,
            percent = event.percent,
            artifact = event.artifact.as_deref(),
            "progress"
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn phases(&self) -> Vec<RunPhase> {
        let mut phases: Vec<RunPhase> = Vec::new();
        for event in self.events() {
            if phases.last() != Some(&event.phase) {
                phases.push(event.phase);
            }
        }
        phases
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_folds_repeated_phases() {
        let sink = CollectingSink::new();
        sink.emit(ProgressEvent::phase(RunPhase::Preparing));
        sink.emit(ProgressEvent::phase(RunPhase::Extracting).with_artifact("fw.bin"));
        sink.emit(ProgressEvent::phase(RunPhase::Extracting).with_percent(150.0));
        sink.emit(ProgressEvent::phase(RunPhase::Finished));

        assert_eq!(sink.events().len(), 4);
        assert_eq!(sink.events()[2].percent, Some(100.0));
        assert_eq!(
            sink.phases(),
            vec![RunPhase::Preparing, RunPhase::Extracting, RunPhase::Finished]
        );
    }

    #[test]
    fn events_serialize_with_snake_case_phase() {
        let event = ProgressEvent::phase(RunPhase::Materializing);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"phase":"materializing","percent":null,"artifact":null}"#);
    }
}
