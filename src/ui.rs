//! Terminal presentation for the operator binaries: request stages with a
//! spinner on TTYs, and one-line renderings of dashboard notices and
//! sessions.

use chrono::{DateTime, Local, Utc};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::dashboard::{ConnectionStatus, Notice};
use crate::session::{SessionStatus, VehicleSession};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    fn pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }
}

/// Reports the stage as done when dropped, unless `fail` was called.
pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failed: bool,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            failed: false,
        }
    }

    pub fn fail(mut self) {
        self.failed = true;
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let mark = if self.failed { "✘" } else { "✔" };
        let message = format!(
            "{} {} ({})",
            mark,
            self.name,
            format_duration(self.start.elapsed())
        );
        match &self.spinner {
            Some(spinner) if self.failed => spinner.abandon_with_message(message),
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn format_fee(fee: u64) -> String {
    let digits = fee.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

pub fn render_session(session: &VehicleSession) -> String {
    match session.status {
        SessionStatus::In => format!(
            "{:<14} IN   since {}",
            session.plate,
            local_time(session.entry_time)
        ),
        SessionStatus::Out => format!(
            "{:<14} OUT  {} -> {}  fee {}",
            session.plate,
            local_time(session.entry_time),
            session.exit_time.map(local_time).unwrap_or_default(),
            format_fee(session.fee.unwrap_or(0))
        ),
    }
}

pub fn render_notice(notice: &Notice) -> String {
    match notice {
        Notice::Entered(session) => format!("entry  {}", render_session(session)),
        Notice::Exited(session) => format!("exit   {}", render_session(session)),
        Notice::DegradedFeed => "backend has no active camera feed".to_string(),
        Notice::FeedRestored => "backend camera feed restored".to_string(),
        Notice::CameraReady => "camera ready".to_string(),
        Notice::CameraFailed(err) => format!("{} ({})", err, err.remediation()),
        Notice::Connection(ConnectionStatus::Connected) => "stream connected".to_string(),
        Notice::Connection(ConnectionStatus::Disconnected) => "stream disconnected".to_string(),
        Notice::Connection(ConnectionStatus::Error) => "stream connection error".to_string(),
        Notice::PollFailed(message) => format!("plate poll failed: {}", message),
    }
}
