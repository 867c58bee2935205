//! pageboot CLI - Command-line tool for page-based serial bootloaders.
//!
//! ## Features
//!
//! - Read the whole flash into a hex file
//! - Write and verify hex firmware images
//! - Inspect hex files without hardware
//! - Interactive serial port selection
//! - Remembered port, baud rate and firmware between runs
//! - Shell completion generation

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    pageboot::CancelToken,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;
mod session;

use {
    commands::{
        completions::cmd_completions,
        device::{cmd_info, cmd_read, cmd_verify, cmd_write},
        firmware::cmd_inspect,
        ports::cmd_list_ports,
    },
    config::{Config, LastUsed},
    session::RunContext,
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors that decide the exit code rather than just carry a message.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The invocation cannot work as given (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The operator gave up (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// pageboot - program microcontrollers through a page-based serial bootloader.
///
/// Environment variables:
///   PAGEBOOT_PORT              - Default serial port
///   PAGEBOOT_BAUD              - Default baud rate (default: 115200)
///   PAGEBOOT_TIMEOUT_MS        - Response timeout per command
///   PAGEBOOT_SETTLE_MS         - Delay before activating the bootloader
///   PAGEBOOT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
///   PAGEBOOT_CONFIG_DIR        - Directory for config.toml and last_used.toml
#[derive(Parser)]
#[command(name = "pageboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "PAGEBOOT_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "PAGEBOOT_BAUD")]
    baud: Option<u32>,

    /// Response timeout per command, in milliseconds.
    #[arg(long, global = true, value_name = "MS", env = "PAGEBOOT_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Delay between opening the port and activating, in milliseconds.
    #[arg(long, global = true, value_name = "MS", env = "PAGEBOOT_SETTLE_MS")]
    settle_ms: Option<u64>,

    /// Talk to an in-memory simulated bootloader instead of a serial port.
    #[arg(long, global = true)]
    simulate: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "PAGEBOOT_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Connect and show the bootloader's identity and flash geometry.
    Info {
        /// Output as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Read the whole flash into a hex file.
    Read {
        /// Output file (".hex" is appended if missing).
        output: PathBuf,
    },

    /// Write a hex file to flash.
    Write {
        /// Firmware file (defaults to the last one written).
        firmware: Option<PathBuf>,

        /// Read the image back after writing.
        #[arg(long, overrides_with = "no_verify")]
        verify: bool,

        /// Skip the read-back.
        #[arg(long)]
        no_verify: bool,
    },

    /// Compare flash against a hex file.
    Verify {
        /// Firmware file (defaults to the last one written).
        firmware: Option<PathBuf>,
    },

    /// Decode a hex file and show what would be written.
    Inspect {
        /// Firmware file.
        firmware: PathBuf,

        /// Page size used for the page estimate.
        #[arg(long, default_value_t = 128, value_parser = clap::value_parser!(u16).range(1..))]
        page_size: u16,

        /// Output as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(&cli);
    debug!(
        "pageboot v{} (verbose level: {})",
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

fn init_logging(cli: &Cli) {
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

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let ctx = RunContext {
        cli,
        config: &config,
        last_used: LastUsed::load(),
        cancel: install_interrupt_handler(),
    };

    match &cli.command {
        Commands::Info { json } => cmd_info(&ctx, *json),
        Commands::Read { output } => cmd_read(&ctx, output),
        Commands::Write {
            firmware,
            verify,
            no_verify,
        } => {
            let verify = match (*verify, *no_verify) {
                (true, _) => Some(true),
                (false, true) => Some(false),
                (false, false) => None,
            };
            cmd_write(&ctx, firmware.as_deref(), verify)
        },
        Commands::Verify { firmware } => cmd_verify(&ctx, firmware.as_deref()),
        Commands::Inspect {
            firmware,
            page_size,
            json,
        } => cmd_inspect(firmware, *page_size, *json),
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

/// First Ctrl-C cancels at the next page boundary, the second exits.
fn install_interrupt_handler() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            std::process::exit(130);
        }
        handler_token.cancel();
    }) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    token
}

fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(pageboot::Error::Cancelled) = cause.downcast_ref::<pageboot::Error>() {
            return 130;
        }
    }
    1
}
