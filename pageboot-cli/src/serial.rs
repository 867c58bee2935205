//! Serial port selection.
//!
//! A port named on the command line or in the config is used as given. The
//! last-used port is reused while it is still attached. Otherwise ports are
//! discovered, narrowed to recognized USB bridges when there are any, and:
//! - one candidate is used directly
//! - several candidates are offered in a prompt, or rejected in
//!   non-interactive mode

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    pageboot::{DetectedPort, discover_ports, host::rank_ports},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Port remembered from the last successful run.
    pub last_used: Option<String>,
    /// Non-interactive mode (fail if several ports).
    pub non_interactive: bool,
}

fn usage_err(message: impl Into<String>) -> anyhow::Error {
    CliError::Usage(message.into()).into()
}

/// Pick the serial port to use.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port_name) = &options.port {
        return Ok(port_name.clone());
    }

    if let Some(port_name) = &config.serial.port {
        debug!("Using port from config: {port_name}");
        return Ok(port_name.clone());
    }

    let ports = discover_ports();

    if let Some(last) = &options.last_used {
        if ports.iter().any(|p| &p.name == last) {
            debug!("Reusing last port: {last}");
            return Ok(last.clone());
        }
        debug!("Last port {last} is no longer present");
    }

    let candidates = candidate_ports(ports, config);
    if options.non_interactive || candidates.len() < 2 {
        return pick_single(candidates).map(|port| {
            info!("Auto-selected port: {}", port.describe());
            port.name
        });
    }

    ensure_interactive_terminal()?;
    select_port_interactive(candidates, config)
}

/// Narrow `ports` to recognized boards, unless none is recognized.
fn candidate_ports(ports: Vec<DetectedPort>, config: &Config) -> Vec<DetectedPort> {
    if ports.iter().any(|p| is_known_device(p, config)) {
        ports
            .into_iter()
            .filter(|p| is_known_device(p, config))
            .collect()
    } else {
        ports
    }
}

/// Exactly one candidate is a valid automatic choice.
fn pick_single(candidates: Vec<DetectedPort>) -> Result<DetectedPort> {
    let mut candidates = candidates.into_iter();
    match (candidates.next(), candidates.next()) {
        (Some(port), None) => Ok(port),
        (Some(_), Some(_)) => Err(usage_err(
            "multiple serial ports found; choose one with --port",
        )),
        (None, _) => Err(usage_err(
            "no serial ports found; connect the board or pass --port",
        )),
    }
}

/// Whether a port is a recognized USB bridge or listed in the config.
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.bridge.is_known() {
        return true;
    }
    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config.knows_board(vid, pid),
        _ => false,
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "several serial ports found and no terminal to ask; choose one with --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".into()).into()
            } else {
                usage_err(format!("port prompt failed: {io_err}"))
            }
        },
    }
}

fn select_port_interactive(ports: Vec<DetectedPort>, config: &Config) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let ports = rank_ports(ports);
    let term_width = usize::from(console::Term::stderr().size().1);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            let label = if is_known_device(port, config) {
                style(port.describe()).bold().to_string()
            } else {
                port.describe()
            };
            console::truncate_str(&label, term_width.saturating_sub(4), "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the bootloader port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .map(|port| port.name)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("port selection cancelled".into()).into()),
    }
}
