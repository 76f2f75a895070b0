// ABOUTME: Terminal rendering of deployment progress and outcomes.
// ABOUTME: Human text on a terminal, final result only under --quiet, JSON lines under --json.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::deploy::{DeploymentOutcome, OutcomeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Normal,
    /// Warnings and the final line only, for CI logs.
    Quiet,
    /// One JSON object per line.
    Json,
}

/// Writes operator-facing messages. Results go to stdout, problems to stderr.
pub struct Output {
    mode: OutputMode,
    started: Option<Instant>,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            started: None,
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Measure from now; the final success line reports the elapsed time.
    pub fn start_timer(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|t| t.elapsed())
    }

    pub fn progress(&self, message: &str) {
        if self.mode == OutputMode::Normal {
            println!("{message}");
        }
    }

    pub fn warning(&self, message: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => eprintln!("Warning: {message}"),
            OutputMode::Json => emit(Stream::Stderr, &Event::new("warning", message)),
        }
    }

    pub fn success(&self, message: &str) {
        match (self.mode, self.elapsed()) {
            (OutputMode::Normal, Some(elapsed)) => {
                println!("{message} (in {})", format_duration(elapsed));
            }
            (OutputMode::Normal | OutputMode::Quiet, _) => println!("{message}"),
            (OutputMode::Json, elapsed) => emit(
                Stream::Stdout,
                &Event::new("success", message).timed(elapsed),
            ),
        }
    }

    pub fn error(&self, message: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => eprintln!("Error: {message}"),
            OutputMode::Json => emit(
                Stream::Stderr,
                &Event::new("error", message).timed(self.elapsed()),
            ),
        }
    }

    /// Render the terminal record of a run: warnings, stage timings, then one headline.
    pub fn outcome(&self, outcome: &DeploymentOutcome) {
        if self.mode == OutputMode::Json {
            emit(
                Stream::Stdout,
                &OutcomeEvent {
                    event: "outcome",
                    outcome,
                },
            );
            return;
        }

        for warning in &outcome.warnings {
            self.warning(&warning.message);
        }

        if self.mode == OutputMode::Normal {
            for timing in &outcome.stages {
                println!(
                    "  {:<16} {}",
                    timing.stage.to_string(),
                    format_duration(timing.duration)
                );
            }
            if let Some(artifact) = &outcome.artifact {
                println!("  {:<16} {artifact}", "artifact");
            }
            if let Some(url) = &outcome.service_url {
                println!("  {:<16} {url}", "url");
            }
        }

        let headline = summary_line(outcome);
        match outcome.status {
            OutcomeStatus::Succeeded => self.success(&headline),
            OutcomeStatus::RolledBack | OutcomeStatus::Failed => self.error(&headline),
        }
    }
}

/// One-line summary of an outcome, shared by `deploy` and `status`.
pub fn summary_line(outcome: &DeploymentOutcome) -> String {
    let verb = match outcome.status {
        OutcomeStatus::Succeeded => "Deployed",
        OutcomeStatus::RolledBack | OutcomeStatus::Failed => "Deploying",
    };
    let mut line = format!(
        "{verb} {} to {} ({}): {}",
        outcome.version, outcome.environment, outcome.region, outcome.status
    );
    if let Some(failure) = &outcome.failure {
        line.push_str(&format!(" ({failure})"));
    }
    if let Some(restored) = &outcome.restored_version {
        line.push_str(&format!("; restored {restored}"));
    }
    if let Some(rollback_failure) = &outcome.rollback_failure {
        line.push_str(&format!("; rollback failed: {rollback_failure}"));
    }
    if outcome.incident {
        line.push_str("; INCIDENT: environment may not be serving a healthy revision");
    }
    line
}

/// Whole seconds, or milliseconds below one second.
pub fn format_duration(duration: Duration) -> String {
    let rounded = Duration::from_secs(duration.as_secs());
    if rounded.is_zero() {
        format!("{}ms", duration.as_millis())
    } else {
        humantime_serde::re::humantime::format_duration(rounded).to_string()
    }
}

enum Stream {
    Stdout,
    Stderr,
}

fn emit<T: Serialize>(stream: Stream, event: &T) {
    let Ok(json) = serde_json::to_string(event) else {
        return;
    };
    match stream {
        Stream::Stdout => println!("{json}"),
        Stream::Stderr => eprintln!("{json}"),
    }
}

#[derive(Serialize)]
struct Event<'a> {
    event: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    elapsed: Option<Duration>,
}

impl<'a> Event<'a> {
    fn new(event: &'a str, message: &'a str) -> Self {
        Self {
            event,
            message,
            elapsed: None,
        }
    }

    fn timed(self, elapsed: Option<Duration>) -> Self {
        Self { elapsed, ..self }
    }
}

#[derive(Serialize)]
struct OutcomeEvent<'a> {
    event: &'a str,
    #[serde(flatten)]
    outcome: &'a DeploymentOutcome,
}
