//! Settings files.
//!
//! A setting comes from the first source that has it:
//! 1. Command-line flags
//! 2. `PAGEBOOT_*` environment variables
//! 3. `./pageboot.toml`
//! 4. `config.toml` in the config directory
//! 5. `last_used.toml` in the config directory, rewritten after every
//!    successful device command
//!
//! The config directory is the platform one from `directories`, unless
//! `PAGEBOOT_CONFIG_DIR` points elsewhere.
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud = 57600
//! boards = [{ vid = 0x2341, pid = 0x0043 }]
//!
//! [protocol]
//! response_timeout_ms = 3000
//! settle_ms = 500
//!
//! [write]
//! verify = true
//! ```

use {
    directories::ProjectDirs,
    log::{debug, info, warn},
    pageboot::port::{FALLBACK_BAUD, STANDARD_BAUDS},
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    std::{
        env, fs,
        path::{Path, PathBuf},
    },
};

/// Settings file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "pageboot.toml";

const CONFIG_DIR_ENV: &str = "PAGEBOOT_CONFIG_DIR";
const GLOBAL_CONFIG_FILE: &str = "config.toml";
const LAST_USED_FILE: &str = "last_used.toml";

/// A USB VID:PID pair identifying a bootloader board.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbId {
    /// Vendor ID.
    pub vid: u16,
    /// Product ID.
    pub pid: u16,
}

/// `[serial]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialSection {
    /// Port to use without asking.
    pub port: Option<String>,
    /// Line rate.
    pub baud: Option<u32>,
    /// Boards to prefer during auto-detection besides the common USB bridges.
    #[serde(default)]
    pub boards: Vec<UsbId>,
}

/// `[protocol]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolSection {
    /// How long to wait for each response.
    pub response_timeout_ms: Option<u64>,
    /// Pause between opening the port and activating.
    pub settle_ms: Option<u64>,
}

/// `[write]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteSection {
    /// Read the image back after writing.
    pub verify: Option<bool>,
}

/// Contents of a settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial settings.
    #[serde(default)]
    pub serial: SerialSection,
    /// Protocol timing.
    #[serde(default)]
    pub protocol: ProtocolSection,
    /// Write defaults.
    #[serde(default)]
    pub write: WriteSection,
}

impl Config {
    /// The global file overlaid with the local one.
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Some(path) = global_config_path() {
            if let Some(global) = read_toml(&path) {
                debug!("Loaded {}", path.display());
                config.overlay(global);
            }
        }
        if let Some(local) = read_toml(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded {LOCAL_CONFIG_FILE}");
            config.overlay(local);
        }
        config
    }

    /// Only the file given with `--config`.
    pub fn load_from_path(path: &Path) -> Self {
        read_toml(path).unwrap_or_else(|| {
            warn!("Ignoring {}, using default settings", path.display());
            Self::default()
        })
    }

    /// Whether `vid:pid` is one of the configured boards.
    pub fn knows_board(&self, vid: u16, pid: u16) -> bool {
        self.serial
            .boards
            .contains(&UsbId { vid, pid })
    }

    /// Take every value `top` sets; boards accumulate.
    fn overlay(&mut self, top: Self) {
        let Self {
            serial,
            protocol,
            write,
        } = top;

        self.serial.port = serial.port.or(self.serial.port.take());
        self.serial.baud = serial.baud.or(self.serial.baud);
        for board in serial.boards {
            if !self.serial.boards.contains(&board) {
                self.serial.boards.push(board);
            }
        }
        self.protocol.response_timeout_ms = protocol
            .response_timeout_ms
            .or(self.protocol.response_timeout_ms);
        self.protocol.settle_ms = protocol.settle_ms.or(self.protocol.settle_ms);
        self.write.verify = write.verify.or(self.write.verify);
    }
}

/// Choices remembered from the last successful device command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUsed {
    /// Serial port.
    pub port: Option<String>,
    /// Line rate.
    pub baud: Option<u32>,
    /// Firmware file written or verified.
    pub firmware: Option<PathBuf>,
    /// Verify choice of the last write.
    pub verify: Option<bool>,
}

impl LastUsed {
    /// Read `last_used.toml`, or nothing remembered.
    pub fn load() -> Self {
        last_used_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    /// Read preferences from `path`.
    pub fn load_from(path: &Path) -> Self {
        read_toml(path).unwrap_or_default()
    }

    /// Rewrite `last_used.toml`.
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = config_dir()
            .ok_or_else(|| anyhow::anyhow!("no configuration directory on this platform"))?;
        fs::create_dir_all(&dir)?;
        self.save_to(&dir.join(LAST_USED_FILE))
    }

    /// Write preferences to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        info!("Remembered settings in {}", path.display());
        Ok(())
    }

    /// Remembered baud rate; one that is not offered any more becomes 19200.
    pub fn baud(&self) -> Option<u32> {
        self.baud.map(|baud| {
            if STANDARD_BAUDS.contains(&baud) {
                baud
            } else {
                debug!("Stored baud rate {baud} is not offered, using {FALLBACK_BAUD}");
                FALLBACK_BAUD
            }
        })
    }

    /// Remembered firmware file, if it still exists.
    pub fn existing_firmware(&self) -> Option<&Path> {
        self.firmware
            .as_deref()
            .filter(|path| path.is_file())
    }
}

/// Directory holding `config.toml` and `last_used.toml`.
pub fn config_dir() -> Option<PathBuf> {
    match env::var_os(CONFIG_DIR_ENV) {
        Some(dir) => Some(PathBuf::from(dir)),
        None => ProjectDirs::from("", "", "pageboot").map(|dirs| dirs.config_dir().to_path_buf()),
    }
}

fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

fn last_used_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(LAST_USED_FILE))
}

/// Parse a TOML file; an unreadable one is reported and skipped.
fn read_toml<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    let parsed = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|text| toml::from_str(&text).map_err(|e| e.to_string()));
    match parsed {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to parse TOML file {}: {e}", path.display());
            None
        },
    }
}
