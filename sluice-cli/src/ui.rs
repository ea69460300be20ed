//! Progress spinner on stderr.
//!
//! Silent under `--quiet`, with `SLUICE_QUIET=1`, or when stderr is not a
//! terminal, so NDJSON on stdout stays clean for pipes.

use std::fmt::Display;
use std::future::Future;
use std::io::IsTerminal;
use std::sync::OnceLock;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

static QUIET_MODE: OnceLock<bool> = OnceLock::new();

pub const QUIET_ENV: &str = "SLUICE_QUIET";

const TICK: Duration = Duration::from_millis(100);

/// Call once at startup with the --quiet flag value.
pub fn init_quiet_mode(quiet_flag: bool) {
    let quiet = quiet_flag
        || std::env::var(QUIET_ENV).is_ok_and(|v| v == "1")
        || !std::io::stderr().is_terminal();
    QUIET_MODE.set(quiet).ok();
}

pub fn is_quiet() -> bool {
    QUIET_MODE.get().copied().unwrap_or(false)
}

/// Spinner for one long-running read; every method is a no-op when quiet.
pub struct Progress(Option<ProgressBar>);

impl Progress {
    pub fn start(msg: impl Into<String>) -> Self {
        if is_quiet() {
            return Self(None);
        }
        let bar = ProgressBar::new_spinner();
        bar.set_message(msg.into());
        bar.enable_steady_tick(TICK);
        Self(Some(bar))
    }

    pub fn update(&self, msg: impl Into<String>) {
        if let Some(bar) = &self.0 {
            bar.set_message(msg.into());
        }
    }

    /// Replace the spinner with a final status line.
    pub fn finish(self, ok: bool, msg: impl Display) {
        let Some(bar) = self.0 else { return };
        bar.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
        let status = if ok { "done" } else { "failed" };
        bar.finish_with_message(format!("{status}: {msg}"));
    }
}

/// Await `work` behind a spinner labelled `msg`.
pub async fn track<T, E: Display>(
    msg: impl Into<String>,
    work: impl Future<Output = Result<T, E>>,
) -> Result<T, E> {
    let msg = msg.into();
    let progress = Progress::start(msg.as_str());
    let outcome = work.await;
    match &outcome {
        Ok(_) => progress.finish(true, msg),
        Err(e) => progress.finish(false, format_args!("{msg}: {e}")),
    }
    outcome
}
