//! User configuration
//!
//! The configuration file lives at `esprom.toml` in the platform's
//! configuration directory. Every field is optional:
//!
//! ```toml
//! [connection]
//! serial = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [image]
//! flash_base = 0x40200000
//! ```

use std::{
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{error::Error, image_format::DEFAULT_FLASH_BASE};

const CONFIG_FILE: &str = "esprom.toml";
pub const DEFAULT_BAUD: u32 = 115_200;

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub image: ImageConfig,
}

/// Preferred serial connection
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Name of the serial port used when none is given
    pub serial: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            serial: None,
            baud: DEFAULT_BAUD,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    /// Sections at or above this address execute from flash
    #[serde(default = "default_flash_base")]
    pub flash_base: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            flash_base: DEFAULT_FLASH_BASE,
        }
    }
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

fn default_flash_base() -> u32 {
    DEFAULT_FLASH_BASE
}

impl Config {
    /// Load the config from the user's configuration directory
    pub fn load() -> Result<Self, Error> {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load the config from `path`, falling back to the defaults if the file
    /// does not exist
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let data = match read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No config file at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::FileOpen(path.display().to_string(), e)),
        };

        let config: Config = toml::from_str(&data)?;
        debug!("Config: {:#?}", config);

        Ok(config)
    }

    pub fn path() -> Option<PathBuf> {
        ProjectDirs::from("rs", "esp", "esprom").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }
}
