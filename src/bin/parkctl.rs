//! parkctl - operator CLI for the parking backend.
//!
//! Logs in (storing the session locally), and drives the admin surfaces:
//! users, parking configuration and parking sessions. Admin commands require
//! a stored session with the admin role.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use parkscan::api::{
    ApiClient, NewUser, ParkingConfig, ParkingConfigUpdate, SessionUpdate, UserUpdate,
};
use parkscan::auth::{allows, SessionStore, StoredSession, Surface};
use parkscan::config::AgentConfig;
use parkscan::ui::{Ui, UiMode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Operator CLI for the ParkScan backend")]
struct Args {
    /// Agent config file (.toml or .json); supplies the API URL and session file.
    #[arg(long, env = "PARKSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Backend base URL (overrides the config file).
    #[arg(long)]
    api_url: Option<String>,

    /// Request timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Progress display.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Log in and store the session locally.
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "PARKSCAN_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored session.
    Logout,
    /// Show the stored session.
    Whoami,
    /// Latest plate read by the backend.
    Plate,
    /// Ask the backend to check a plate in or out.
    Check { plate: String },
    /// Send one JPEG for recognition and print the plate and boxes.
    Upload {
        image: PathBuf,
        /// Write the backend's annotated frame here, when it returns one.
        #[arg(long)]
        annotated: Option<PathBuf>,
    },
    #[command(subcommand)]
    Users(UsersCmd),
    #[command(subcommand)]
    Config(ConfigCmd),
    #[command(subcommand)]
    Sessions(SessionsCmd),
}

#[derive(Subcommand, Debug)]
enum UsersCmd {
    List,
    Show {
        username: String,
    },
    Create {
        #[arg(long)]
        username: String,
        #[arg(long, env = "PARKSCAN_NEW_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        role: Option<String>,
    },
    Modify {
        username: String,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        active: Option<bool>,
    },
    Delete {
        username: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    List,
    Create {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        vehicle_type: String,
        #[arg(long)]
        max_capacity: u64,
        #[arg(long)]
        price_per_hour: u64,
    },
    Update {
        id: u64,
        #[arg(long)]
        vehicle_type: Option<String>,
        #[arg(long)]
        max_capacity: Option<u64>,
        #[arg(long)]
        price_per_hour: Option<u64>,
    },
    Delete {
        id: u64,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsCmd {
    List,
    Show {
        plate: String,
    },
    Update {
        plate: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        timeout: Option<String>,
    },
    Delete {
        id: u64,
    },
}

impl Cmd {
    fn surface(&self) -> Surface {
        match self {
            Cmd::Login { .. } | Cmd::Logout | Cmd::Whoami => Surface::Login,
            Cmd::Plate
            | Cmd::Check { .. }
            | Cmd::Upload { .. }
            | Cmd::Sessions(SessionsCmd::Show { .. }) => {
                Surface::UserDashboard
            }
            Cmd::Users(_) | Cmd::Config(_) | Cmd::Sessions(_) => Surface::Admin,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("render response")?
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = Ui::new(args.ui, std::io::stderr().is_terminal());

    let mut config = AgentConfig::load_from(args.config.as_deref())?;
    if let Some(url) = &args.api_url {
        config.api_base_url = url.clone();
    }
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(config.request_timeout);
    let api = ApiClient::new(&config.api_base_url, timeout)?;
    let store = SessionStore::new(&config.session_path);
    let session = store.load()?;

    let surface = args.command.surface();
    if !allows(session.as_ref(), surface) {
        return Err(match surface {
            Surface::Admin => anyhow!("this command needs an admin login"),
            _ => anyhow!("not logged in; run `parkctl login` first"),
        });
    }

    run(args.command, &api, &store, session, &ui)
}

/// Run `call` inside a UI stage, marking the stage failed on error.
fn staged<T>(ui: &Ui, name: &str, call: impl FnOnce() -> Result<T>) -> Result<T> {
    let stage = ui.stage(name);
    match call() {
        Ok(value) => Ok(value),
        Err(err) => {
            stage.fail();
            Err(err)
        }
    }
}

fn run(
    command: Cmd,
    api: &ApiClient,
    store: &SessionStore,
    session: Option<StoredSession>,
    ui: &Ui,
) -> Result<()> {
    match command {
        Cmd::Login { username, password } => {
            let response = staged(ui, "Log in", || Ok(api.login(&username, &password)?))?;
            let stored = StoredSession::from_login(&username, &response);
            store.save(&stored)?;
            println!(
                "logged in as {} ({}); session stored at {}",
                stored.username,
                stored.role.as_str(),
                store.path().display()
            );
        }
        Cmd::Logout => {
            store.clear()?;
            println!("logged out");
        }
        Cmd::Whoami => match session {
            Some(session) => print_json(&session)?,
            None => println!("not logged in"),
        },
        Cmd::Plate => print_json(&staged(ui, "Fetch latest plate", || Ok(api.get_plate()?))?)?,
        Cmd::Check { plate } => {
            print_json(&staged(ui, "Check plate", || Ok(api.auto_check(&plate)?))?)?
        }
        Cmd::Upload { image, annotated } => {
            let jpeg = std::fs::read(&image)
                .with_context(|| format!("read image {}", image.display()))?;
            let reply = staged(ui, "Upload image", || Ok(api.upload_image(&jpeg)?))?;
            if let (Some(path), Some(frame)) = (&annotated, &reply.frame) {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(frame.trim())
                    .context("decode annotated frame")?;
                std::fs::write(path, bytes)
                    .with_context(|| format!("write annotated frame {}", path.display()))?;
                eprintln!("annotated frame written to {}", path.display());
            } else if annotated.is_some() {
                eprintln!("backend returned no annotated frame");
            }
            print_json(&reply.reading)?;
        }
        Cmd::Users(command) => {
            let reply = match command {
                UsersCmd::List => staged(ui, "List users", || Ok(api.get_all_users()?))?,
                UsersCmd::Show { username } => {
                    staged(ui, "Fetch user", || Ok(api.get_user(&username)?))?
                }
                UsersCmd::Create {
                    username,
                    password,
                    email,
                    role,
                } => {
                    let user = NewUser {
                        username,
                        password,
                        email,
                        role,
                    };
                    staged(ui, "Create user", || Ok(api.create_user(&user)?))?
                }
                UsersCmd::Modify {
                    username,
                    password,
                    role,
                    active,
                } => {
                    let update = UserUpdate {
                        password,
                        role,
                        is_active: active,
                    };
                    staged(ui, "Modify user", || Ok(api.modify_user(&username, &update)?))?
                }
                UsersCmd::Delete { username } => {
                    staged(ui, "Delete user", || Ok(api.delete_user(&username)?))?
                }
            };
            print_json(&reply)?;
        }
        Cmd::Config(command) => {
            let reply = match command {
                ConfigCmd::List => {
                    staged(ui, "Fetch parking config", || Ok(api.get_parking_config()?))?
                }
                ConfigCmd::Create {
                    id,
                    vehicle_type,
                    max_capacity,
                    price_per_hour,
                } => {
                    let config = ParkingConfig {
                        id,
                        vehicle_type,
                        max_capacity,
                        price_per_hour,
                    };
                    staged(ui, "Create parking config", || {
                        Ok(api.create_parking_config(&config)?)
                    })?
                }
                ConfigCmd::Update {
                    id,
                    vehicle_type,
                    max_capacity,
                    price_per_hour,
                } => {
                    let update = ParkingConfigUpdate {
                        vehicle_type,
                        max_capacity,
                        price_per_hour,
                    };
                    staged(ui, "Update parking config", || {
                        Ok(api.update_parking_config(id, &update)?)
                    })?
                }
                ConfigCmd::Delete { id } => staged(ui, "Delete parking config", || {
                    Ok(api.delete_parking_config(id)?)
                })?,
            };
            print_json(&reply)?;
        }
        Cmd::Sessions(command) => {
            let reply = match command {
                SessionsCmd::List => staged(ui, "List parking sessions", || {
                    Ok(api.get_all_parking_sessions()?)
                })?,
                SessionsCmd::Show { plate } => staged(ui, "Fetch parking session", || {
                    Ok(api.get_parking_session(&plate)?)
                })?,
                SessionsCmd::Update {
                    plate,
                    status,
                    timeout,
                } => {
                    let update = SessionUpdate { status, timeout };
                    staged(ui, "Update parking session", || {
                        Ok(api.update_parking_session(&plate, &update)?)
                    })?
                }
                SessionsCmd::Delete { id } => staged(ui, "Delete parking session", || {
                    Ok(api.delete_parking_session(id)?)
                })?,
            };
            print_json(&reply)?;
        }
    }
    Ok(())
}
