//! Connecting to the bootloader and reporting progress.

use {
    crate::{
        Cli,
        config::{Config, LastUsed},
        serial::{SerialOptions, select_serial_port},
        use_fancy_output,
    },
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::{debug, warn},
    pageboot::{
        CancelToken, DeviceInfo, EngineConfig, Flasher, FlasherConfig, Port, ProgressEvent,
        ProgressForwarder, SerialConfig, SimulatedDevice,
        flasher::DEFAULT_SETTLE_DELAY,
        port::DEFAULT_BAUD,
        protocol::engine::DEFAULT_RESPONSE_TIMEOUT,
    },
    std::{path::Path, time::Duration},
};

/// Port name shown for the in-memory bootloader.
const SIMULATED_PORT: &str = "simulated";

/// Everything a device command needs, resolved once per run.
pub(crate) struct RunContext<'a> {
    pub cli: &'a Cli,
    pub config: &'a Config,
    pub last_used: LastUsed,
    pub cancel: CancelToken,
}

/// A connected flasher plus what it was connected with.
pub(crate) struct Session {
    pub flasher: Flasher<Box<dyn Port>>,
    pub port: String,
    pub baud: u32,
}

impl RunContext<'_> {
    /// Baud rate from the flag/env, then config, then the last run.
    pub fn baud(&self) -> u32 {
        self.cli
            .baud
            .or(self.config.serial.baud)
            .or_else(|| self.last_used.baud())
            .unwrap_or(DEFAULT_BAUD)
    }

    fn flasher_config(&self) -> FlasherConfig {
        let timeout = self
            .cli
            .timeout_ms
            .or(self.config.protocol.response_timeout_ms)
            .map_or(DEFAULT_RESPONSE_TIMEOUT, Duration::from_millis);
        let settle = self
            .cli
            .settle_ms
            .or(self.config.protocol.settle_ms)
            .map_or(DEFAULT_SETTLE_DELAY, Duration::from_millis);

        FlasherConfig::default()
            .with_settle_delay(settle)
            .with_engine(EngineConfig::default().with_response_timeout(timeout))
    }

    /// Open the port, activate the bootloader and print what answered.
    pub fn connect(&self) -> Result<Session> {
        let baud = self.baud();
        let port = if self.cli.simulate {
            SIMULATED_PORT.to_string()
        } else {
            let options = SerialOptions {
                port: self.cli.port.clone(),
                last_used: self.last_used.port.clone(),
                non_interactive: self.cli.non_interactive,
            };
            select_serial_port(&options, self.config)?
        };

        if !self.cli.quiet {
            eprintln!(
                "{} Using port {} at {} baud",
                style("🔌").cyan(),
                style(&port).bold(),
                baud
            );
            eprintln!("{} Waiting for the bootloader...", style("⏳").yellow());
        }

        let mut flasher: Flasher<Box<dyn Port>> =
            Flasher::new(self.flasher_config()).with_cancel_token(self.cancel.clone());
        let info = if self.cli.simulate {
            flasher.connect(|| Ok(Box::new(SimulatedDevice::default()) as Box<dyn Port>))
        } else {
            let serial = SerialConfig::new(port.as_str(), baud);
            flasher.connect(|| {
                pageboot::NativePort::open(&serial).map(|p| Box::new(p) as Box<dyn Port>)
            })
        }
        .with_context(|| format!("could not connect to the bootloader on {port}"))?;

        if !self.cli.quiet {
            print_device_info(info);
        }
        Ok(Session {
            flasher,
            port,
            baud,
        })
    }

    /// Remember port, baud and optionally firmware/verify for the next run.
    pub fn remember(&self, session: &Session, firmware: Option<&Path>, verify: Option<bool>) {
        let mut prefs = self.last_used.clone();
        if !self.cli.simulate {
            prefs.port = Some(session.port.clone());
        }
        prefs.baud = Some(session.baud);
        if let Some(path) = firmware {
            prefs.firmware = Some(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()));
        }
        if verify.is_some() {
            prefs.verify = verify;
        }
        if prefs == self.last_used {
            return;
        }
        if let Err(e) = prefs.save() {
            warn!("Could not save preferences: {e:#}");
        }
    }
}

fn print_device_info(info: &DeviceInfo) {
    eprintln!("{} Connected", style("✓").green());
    eprintln!(
        "    {} {} ({}), bootloader v{}",
        style("•").dim(),
        info.device_name_lossy(),
        info.module_name_lossy(),
        info.version
    );
    eprintln!(
        "    {} flash {} KB, boot section {} bytes, page {} bytes",
        style("•").dim(),
        info.flash_kb,
        info.boot_size,
        info.page_size
    );
}

/// Progress bar on stderr fed from the flasher's page loops.
pub(crate) struct Progress {
    bar: ProgressBar,
    forwarder: ProgressForwarder,
}

impl Progress {
    /// Start the bar; hidden in quiet mode or without a terminal.
    pub fn start(quiet: bool) -> Result<Self> {
        let bar = if quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(0);
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} {msg:10} [{bar:40.cyan/blue}] {pos}/{len} pages ({elapsed})",
                    )
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb.set_draw_target(ProgressDrawTarget::stderr());
            pb
        };

        let sink = bar.clone();
        let forwarder = ProgressForwarder::spawn(move |event| match event {
            ProgressEvent::Begin { phase, total } => {
                sink.reset();
                sink.set_length(total as u64);
                sink.set_message(phase.to_string());
            },
            ProgressEvent::Advance { current, .. } => sink.set_position(current as u64),
            ProgressEvent::Reset { phase } => {
                debug!("{phase} aborted");
                sink.reset();
            },
        })
        .context("could not start the progress thread")?;

        Ok(Self { bar, forwarder })
    }

    /// Callback to hand to the flasher.
    pub fn callback(&self) -> impl FnMut(ProgressEvent) + '_ {
        self.forwarder.callback()
    }

    /// Drain pending events and take the bar down.
    pub fn finish(self) {
        self.forwarder.finish();
        self.bar.finish_and_clear();
    }
}
