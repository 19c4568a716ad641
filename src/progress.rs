//! Submission progress reporting.
//!
//! Reports observable progress during `svo submit` so users see which
//! dataset is being processed and how many items are done.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a submission batch.
#[derive(Clone, Debug)]
pub enum SubmitProgressEvent {
    /// Setting up: fetching dataset info and keyword definitions.
    Preparing { dataset: String },
    /// n items processed. The total is unknown for paginated TAP sources.
    Processing {
        dataset: String,
        n: u64,
        failed: u64,
        total: Option<u64>,
    },
}

/// Reports submission progress. Implementations write to stderr (human or JSON).
pub trait SubmitProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the provider batch loop.
    fn report(&self, event: SubmitProgressEvent);
}

/// Human-friendly progress on stderr: "submit SWAP level 1  1,234 / 5,000 items (2 failed)".
pub struct StderrProgress;

impl SubmitProgressReporter for StderrProgress {
    fn report(&self, event: SubmitProgressEvent) {
        let line = match &event {
            SubmitProgressEvent::Preparing { dataset } => {
                format!("submit {}  preparing...\n", dataset)
            }
            SubmitProgressEvent::Processing {
                dataset,
                n,
                failed,
                total,
            } => {
                let done = match total {
                    Some(total) => format!("{} / {}", format_number(*n), format_number(*total)),
                    None => format_number(*n),
                };
                if *failed > 0 {
                    format!(
                        "submit {}  {} items ({} failed)\n",
                        dataset,
                        done,
                        format_number(*failed)
                    )
                } else {
                    format!("submit {}  {} items\n", dataset, done)
                }
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SubmitProgressReporter for JsonProgress {
    fn report(&self, event: SubmitProgressEvent) {
        let obj = match &event {
            SubmitProgressEvent::Preparing { dataset } => serde_json::json!({
                "event": "progress",
                "dataset": dataset,
                "phase": "preparing"
            }),
            SubmitProgressEvent::Processing {
                dataset,
                n,
                failed,
                total,
            } => serde_json::json!({
                "event": "progress",
                "dataset": dataset,
                "phase": "processing",
                "n": n,
                "failed": failed,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SubmitProgressReporter for NoProgress {
    fn report(&self, _event: SubmitProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn SubmitProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn reporter_for_mode() {
        // Smoke test: every mode yields a reporter that accepts events.
        for mode in [ProgressMode::Off, ProgressMode::Human, ProgressMode::Json] {
            mode.reporter().report(SubmitProgressEvent::Processing {
                dataset: "SWAP level 1".into(),
                n: 1,
                failed: 0,
                total: None,
            });
        }
    }
}
