//! Init supervisor binary.
//!
//! With no subcommand this runs as the supervisor. The `switch` and
//! `manage` subcommands are one-shot clients that talk to the running
//! supervisor over its control socket.

use clap::{Parser, Subcommand};
use initd::control::{ControlClient, ControlCommand, ControlResponse};
use initd::supervisor::{Supervisor, SupervisorConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "init", about = "Runlevel-based init supervisor", version)]
struct Cli {
    /// Inittab configuration file
    #[arg(short, long, default_value = initd::CONFIG_FILE)]
    config: PathBuf,

    /// Audit log file
    #[arg(long, default_value = initd::LOG_FILE)]
    log_file: PathBuf,

    /// Control socket path
    #[arg(long, default_value = initd::CONTROL_SOCKET)]
    socket: PathBuf,

    /// Initial runlevel
    #[arg(short, long, default_value_t = 0)]
    runlevel: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Switch the running supervisor to another runlevel
    Switch {
        /// Target runlevel
        level: u8,
    },

    /// Manage a single service
    Manage {
        #[command(subcommand)]
        action: ManageAction,
    },
}

#[derive(Subcommand)]
enum ManageAction {
    /// Start a service
    Start { name: String },
    /// Stop a service
    Stop { name: String },
    /// Show whether a service is running
    Status { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => {
            let config = SupervisorConfig {
                inittab: cli.config,
                audit_log: cli.log_file,
                control_socket: cli.socket,
                runlevel: cli.runlevel,
                ..SupervisorConfig::default()
            };
            Supervisor::new(config).run().await?;
        }

        Some(Commands::Switch { level }) => {
            let client = ControlClient::new(&cli.socket);
            match client.send(ControlCommand::SwitchRunlevel { level }).await {
                Ok(ControlResponse::Ok { message }) => println!("{}", message),
                Ok(ControlResponse::Error { message }) => {
                    eprintln!("{}", message);
                    std::process::exit(2);
                }
                Ok(other) => {
                    eprintln!("unexpected response: {:?}", other);
                    std::process::exit(2);
                }
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(2);
                }
            }
        }

        Some(Commands::Manage { action }) => manage(&cli.socket, action).await,
    }

    Ok(())
}

async fn manage(socket: &PathBuf, action: ManageAction) {
    let client = ControlClient::new(socket);

    match action {
        ManageAction::Status { name } => {
            match client.send(ControlCommand::ServiceStatus { name }).await {
                Ok(ControlResponse::Status { state, .. }) => println!("{}", state),
                Ok(_) => {
                    println!("not found");
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }

        ManageAction::Start { name } => {
            match client.send(ControlCommand::StartService { name }).await {
                Ok(ControlResponse::Ok { message }) => println!("{}", message),
                Ok(ControlResponse::Error { message }) => {
                    eprintln!("{}", message);
                    std::process::exit(1);
                }
                Ok(other) => {
                    eprintln!("unexpected response: {:?}", other);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }

        ManageAction::Stop { name } => {
            match client.send(ControlCommand::StopService { name }).await {
                Ok(ControlResponse::Ok { message }) => println!("{}", message),
                Ok(ControlResponse::Error { message }) => {
                    eprintln!("{}", message);
                    std::process::exit(1);
                }
                Ok(other) => {
                    eprintln!("unexpected response: {:?}", other);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
