use std::io::{self, BufRead};
use std::process::ExitCode;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use imapmirror::app::{reset_checkpoint, App, AppError};
use imapmirror::config::{Config, SyncMode};
use imapmirror::credentials::CredentialManager;
use imapmirror::shutdown::Shutdown;

/// Mirrors an IMAP folder to another server, a local directory or an
/// auto-responder, and keeps watching it for new mail
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file (YAML, or JSON if it ends in .json)
    #[clap(short, long, default_value = "~/.config/imapmirror/config.yaml")]
    config: String,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// Run a single sync pass even if the config enables watching
    #[clap(long)]
    once: bool,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store an IMAP password in the system keyring (read from stdin)
    SetPassword {
        /// Account as user@server
        #[clap(short, long)]
        account: String,
    },

    /// Reset the source checkpoint without connecting
    Reset {
        /// all: copy everything on the next run; new: only mail arriving after it
        #[clap(short, long, default_value = "new")]
        mode: SyncMode,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .parse_default_env()
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    if let Some(Commands::SetPassword { account }) = &args.command {
        return set_password(account);
    }

    let config_path = shellexpand::tilde(&args.config).into_owned();
    let config = Config::load(&config_path).with_context(|| format!("Failed to load config from {}", config_path))?;

    match args.command {
        Some(Commands::Reset { mode }) => {
            reset_checkpoint(&config, mode)?;
            Ok(())
        }
        Some(Commands::SetPassword { .. }) => Ok(()),
        None => {
            let shutdown = Shutdown::new();
            let mut app = App::new(&config, shutdown.clone()).context("Invalid configuration")?;
            if args.once {
                app.set_watch(false);
            }
            spawn_signal_listener(shutdown);
            app.run().map_err(|e| match e {
                AppError::CredentialError(e) => e,
                other => other.into(),
            })
        }
    }
}

fn set_password(account: &str) -> Result<()> {
    if !account.contains('@') {
        bail!("Account must be given as user@server");
    }

    eprintln!("Password for {}:", account);
    let mut password = String::new();
    io::stdin()
        .lock()
        .read_line(&mut password)
        .context("Failed to read password")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("Empty password, nothing stored");
    }

    CredentialManager::new().store_password(account, "imap", password)?;
    info!("Password for {} stored in the system keyring", account);
    Ok(())
}

/// Triggers `shutdown` on Ctrl-C or SIGTERM.
fn spawn_signal_listener(shutdown: Shutdown) {
    let spawned = thread::Builder::new().name("signals".to_string()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Signal handling unavailable: {}", e);
                return;
            }
        };

        runtime.block_on(async {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        tokio::select! {
                            _ = ctrl_c => {},
                            _ = sigterm.recv() => {},
                        }
                    }
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        ctrl_c.await.ok();
                    }
                }
            }
            #[cfg(not(unix))]
            {
                ctrl_c.await.ok();
            }
        });

        info!("Shutdown requested");
        shutdown.trigger();
    });

    if let Err(e) = spawned {
        warn!("Signal handling unavailable: {}", e);
    }
}
