//! A library and application for talking to the ESP8266 ROM bootloader
//!
//! The bootloader is reached over a serial [connection](connection::Connection)
//! and can download code to RAM, write flash, and read or write registers.
//! Firmware ELF files are turned into bootloader images with
//! [Image](image_format::Image).

pub mod checksum;
pub mod command;
pub mod config;
pub mod connection;
pub mod elf;
pub mod error;
pub mod flasher;
pub mod image_format;
pub mod progress;
pub mod slip;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod logging;

pub use config::Config;
pub use error::Error;
pub use flasher::Flasher;
pub use image_format::{Image, Section};
