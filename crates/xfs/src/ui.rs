use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use xfs_core::{ProgressEvent, ProgressSink, RunPhase};

const SPINNER_STYLE: &str = "{spinner:.blue} {prefix:>13.cyan.bold} [{elapsed_precise}] {wide_msg}";

const TICK: &str = "⠁⠂⠄⡀⢀⠠⠐⠈ ";

/// Renders progress events as a spinner on stderr.
pub struct SpinnerSink {
    pb: ProgressBar,
}

impl SpinnerSink {
    pub fn new() -> Self {
        let pb = ProgressBar::new_spinner();
        let pb = match ProgressStyle::with_template(SPINNER_STYLE) {
            Ok(style) => pb.with_style(style.tick_chars(TICK)),
            Err(_) => pb,
        };
        pb.enable_steady_tick(Duration::from_millis(120));
        Self { pb }
    }
}

impl Default for SpinnerSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for SpinnerSink {
    fn emit(&self, event: ProgressEvent) {
        self.pb.set_prefix(event.phase.to_string());
        let message = match (event.percent, event.artifact) {
            (Some(percent), Some(artifact)) => format!("{percent:>3.0}% {artifact}"),
            (Some(percent), None) => format!("{percent:>3.0}%"),
            (None, Some(artifact)) => artifact,
            (None, None) => String::new(),
        };
        self.pb.set_message(message);
        if event.phase == RunPhase::Finished {
            self.pb.finish_and_clear();
        }
    }
}

impl Drop for SpinnerSink {
    fn drop(&mut self) {
        if !self.pb.is_finished() {
            self.pb.finish_and_clear();
        }
    }
}
