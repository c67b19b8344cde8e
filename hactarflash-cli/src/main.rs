//! hactarflash CLI - Command-line tool for flashing Hactar boards.
//!
//! ## Features
//!
//! - Flash the mgmt, ui and net processors in one session
//! - Inspect firmware bundles
//! - Interactive serial port selection
//! - Environment variable and config file support

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use hactarflash::ErrorCategory;
use log::debug;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// hactarflash - Flash the processors on a Hactar board over one serial port.
///
/// Environment variables:
///   HACTARFLASH_PORT              - Default serial port
///   HACTARFLASH_MODE              - Default upload mode (e.g. ui+net)
///   HACTARFLASH_FIRMWARE          - Default firmware bundle directory
///   HACTARFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "hactarflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    hactarflash flash --firmware-dir build/hactar\n  \
    hactarflash --port /dev/ttyUSB0 flash --mode mgmt+ui+net\n  \
    hactarflash info build/hactar --json")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "HACTARFLASH_PORT")]
    port: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "HACTARFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash firmware onto the board.
    Flash {
        /// Targets to flash, joined with '+' (mgmt, ui, net).
        #[arg(short, long, env = "HACTARFLASH_MODE")]
        mode: Option<String>,

        /// Firmware bundle directory.
        #[arg(short = 'f', long, value_name = "DIR", env = "HACTARFLASH_FIRMWARE")]
        firmware_dir: Option<PathBuf>,

        /// Read back the whole erased region instead of probing sectors.
        #[arg(long)]
        full_verify: bool,
    },

    /// Show the images a firmware bundle would flash.
    Info {
        /// Firmware bundle directory.
        #[arg(value_name = "DIR", env = "HACTARFLASH_FIRMWARE")]
        dir: Option<PathBuf>,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

/// Errors raised by the CLI itself rather than the flashing library.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Bad arguments or an environment the command cannot run in.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration or firmware bundle.
    #[error("{0}")]
    Config(String),
    /// The user backed out.
    #[error("{0}")]
    Cancelled(String),
}

/// Process exit code for `err`.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return match cli {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }
    if let Some(flash) = err.downcast_ref::<hactarflash::Error>() {
        return match flash.category() {
            ErrorCategory::Configuration => 3,
            ErrorCategory::Transport => 4,
            ErrorCategory::Interrupted => 130,
            ErrorCategory::Protocol | ErrorCategory::Verification => 1,
        };
    }
    1
}

fn init_logger(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            // Second Ctrl-C: give up on a clean stop
            std::process::exit(130);
        }
        eprintln!("\nInterrupted, stopping after the current step...");
    });
    if let Err(e) = result {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    hactarflash::set_interrupt_checker(was_interrupted);
}

fn main() -> ExitCode {
    let stderr_is_tty = std::io::stderr().is_terminal();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if std::env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logger(&cli);
    install_interrupt_handler();

    debug!(
        "hactarflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            mode,
            firmware_dir,
            full_verify,
        } => commands::flash::cmd_flash(
            cli,
            &mut config,
            mode.as_deref(),
            firmware_dir.as_deref(),
            *full_verify,
        ),
        Commands::Info { dir, json } => {
            let dir = dir
                .clone()
                .or_else(|| {
                    config
                        .flash
                        .firmware_dir
                        .clone()
                })
                .unwrap_or_else(|| PathBuf::from("."));
            commands::info::cmd_info(&dir, *json)
        },
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
    }
}

/// Get serial port from CLI args or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli
            .port
            .clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected
        .port
        .name)
}
