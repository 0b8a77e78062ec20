//! gate_agent - headless parking gate dashboard.
//!
//! Runs one gate's capture pipeline (camera, frame pump, telemetry channel,
//! plate poller, session reconciler) in a cooperative loop, and reads operator
//! commands from stdin:
//!
//!   pause | resume             stop / restart sending frames
//!   mode local|annotated       switch display mode
//!   checkout <plate>           close a vehicle's session by hand
//!   sessions                   list sessions
//!   status                     connection and camera state
//!   quit                       tear down and exit

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parkscan::api::{ApiClient, FeedViewer, FeedViewerSettings};
use parkscan::auth::{allows, SessionStore, Surface};
use parkscan::config::AgentConfig;
use parkscan::dashboard::{Dashboard, DisplayMode, Notice};
use parkscan::ui::{render_notice, render_session};

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless parking gate dashboard")]
struct Args {
    /// Agent config file (.toml or .json).
    #[arg(long, env = "PARKSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Loop idle time between steps, in milliseconds.
    #[arg(long, default_value_t = 10)]
    idle_ms: u64,

    /// Write the newest annotated-feed frame here while in annotated mode.
    #[arg(long, env = "PARKSCAN_ANNOTATED_SNAPSHOT")]
    annotated_snapshot: Option<PathBuf>,

    /// Do not read operator commands from stdin.
    #[arg(long)]
    no_console: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    Mode(DisplayMode),
    Checkout(String),
    Sessions,
    Status,
    Quit,
    Help,
}

impl Command {
    fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let rest: Vec<&str> = words.collect();
        let command = match verb.to_ascii_lowercase().as_str() {
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "mode" => match rest.first() {
                Some(mode) => Command::Mode(mode.parse()?),
                None => return Err(anyhow!("usage: mode local|annotated")),
            },
            "checkout" => {
                let plate = rest.join(" ");
                if plate.is_empty() {
                    return Err(anyhow!("usage: checkout <plate>"));
                }
                Command::Checkout(plate)
            }
            "sessions" | "ls" => Command::Sessions,
            "status" => Command::Status,
            "quit" | "exit" => Command::Quit,
            "help" | "?" => Command::Help,
            other => return Err(anyhow!("unknown command '{}' (try help)", other)),
        };
        Ok(Some(command))
    }
}

fn spawn_console(shutdown: Arc<AtomicBool>) -> Result<Receiver<Command>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("operator-console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        log::warn!("console read failed: {}", err);
                        break;
                    }
                };
                match Command::parse(&line) {
                    Ok(Some(command)) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => eprintln!("{:#}", err),
                }
            }
        })
        .context("spawn operator console")?;
    Ok(rx)
}

fn report(notice: &Notice) {
    let line = render_notice(notice);
    match notice {
        Notice::CameraFailed(_) | Notice::PollFailed(_) | Notice::DegradedFeed => {
            log::warn!("{}", line)
        }
        _ => log::info!("{}", line),
    }
}

struct Agent {
    config: AgentConfig,
    dashboard: Dashboard,
    viewer: Option<FeedViewer>,
    snapshot: Option<PathBuf>,
}

impl Agent {
    fn sync_feed_viewer(&mut self) -> Result<()> {
        match self.dashboard.display_mode() {
            DisplayMode::AnnotatedFeed if self.viewer.is_none() => {
                let api = ApiClient::new(&self.config.api_base_url, self.config.request_timeout)?;
                let settings = FeedViewerSettings {
                    reopen_delay: self.config.channel.reconnect_delay,
                    snapshot_path: self.snapshot.clone(),
                };
                self.viewer = Some(FeedViewer::spawn(
                    Box::new(move || api.open_video_feed()),
                    settings,
                )?);
            }
            DisplayMode::LocalCamera => {
                if let Some(mut viewer) = self.viewer.take() {
                    viewer.stop();
                }
            }
            DisplayMode::AnnotatedFeed => {}
        }
        Ok(())
    }

    /// Returns false when the operator asked to quit.
    fn handle(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Pause => self.dashboard.pause_recognition(),
            Command::Resume => self.dashboard.resume_recognition(),
            Command::Mode(mode) => {
                for notice in self.dashboard.switch_display_mode(mode, Instant::now()) {
                    report(&notice);
                }
                self.sync_feed_viewer()?;
            }
            Command::Checkout(plate) => match self.dashboard.checkout(&plate, Utc::now()) {
                Ok(session) => println!("checked out {}", render_session(&session)),
                Err(err) => eprintln!("{}", err),
            },
            Command::Sessions => {
                let sessions = self.dashboard.sessions();
                if sessions.is_empty() {
                    println!("no sessions yet");
                }
                for session in sessions {
                    println!("{}", render_session(session));
                }
            }
            Command::Status => {
                let stats = self.dashboard.pump_stats();
                println!(
                    "display={:?} connection={:?} degraded={} paused={} camera={} frames_sent={} open_sessions={}",
                    self.dashboard.display_mode(),
                    self.dashboard.connection_status(),
                    self.dashboard.is_degraded(),
                    self.dashboard.is_recognition_paused(),
                    if self.dashboard.camera().is_acquired() { "live" } else { "off" },
                    stats.frames_sent,
                    self.dashboard.reconciler().open_count(),
                );
                if let Some(viewer) = &self.viewer {
                    println!("annotated frames received={}", viewer.frames_received());
                }
            }
            Command::Help => println!(
                "commands: pause, resume, mode local|annotated, checkout <plate>, sessions, status, quit"
            ),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }

    fn shutdown(&mut self) {
        self.dashboard.teardown();
        if let Some(mut viewer) = self.viewer.take() {
            viewer.stop();
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = AgentConfig::load_from(args.config.as_deref())?;

    let store = SessionStore::new(&config.session_path);
    let session = store.load()?;
    if !allows(session.as_ref(), Surface::UserDashboard) {
        return Err(anyhow!(
            "no stored login at {}; run `parkctl login` first",
            store.path().display()
        ));
    }
    if let Some(session) = &session {
        log::info!("operator {} ({})", session.username, session.role.as_str());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("install Ctrl-C handler")?;
    }

    let console = if args.no_console {
        None
    } else {
        Some(spawn_console(Arc::clone(&shutdown))?)
    };

    let dashboard = Dashboard::from_config(&config)?;
    let mut agent = Agent {
        config,
        dashboard,
        viewer: None,
        snapshot: args.annotated_snapshot.clone(),
    };
    for notice in agent.dashboard.start(Instant::now()) {
        report(&notice);
    }
    agent.sync_feed_viewer()?;
    log::info!("gate agent running (Ctrl-C or `quit` to stop)");

    let idle = Duration::from_millis(args.idle_ms.max(1));
    let result = run_loop(&mut agent, console.as_ref(), &shutdown, idle);

    shutdown.store(true, Ordering::SeqCst);
    agent.shutdown();
    log::info!("gate agent stopped");
    result
}

fn run_loop(
    agent: &mut Agent,
    console: Option<&Receiver<Command>>,
    shutdown: &AtomicBool,
    idle: Duration,
) -> Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        if let Some(console) = console {
            loop {
                match console.try_recv() {
                    Ok(command) => {
                        if !agent.handle(command)? {
                            return Ok(());
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }
        for notice in agent.dashboard.step(Instant::now(), Utc::now()) {
            report(&notice);
        }
        std::thread::sleep(idle);
    }
    Ok(())
}
