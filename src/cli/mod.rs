//! Types and functions for the command-line interface
//!
//! The [esprom] binary is a thin layer over the functions in this module.
//!
//! [esprom]: https://crates.io/crates/esprom

use std::{
    fs,
    num::ParseIntError,
    path::{Path, PathBuf},
};

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use miette::{IntoDiagnostic, Result, WrapErr};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{
    config::Config,
    connection::DEFAULT_TIMEOUT,
    elf::FirmwareImage,
    error::Error,
    flasher::Flasher,
    image_format::{Image, ImageInfo},
    progress::{ProgressCallbacks, ProgressEvent, ProgressStage},
};

/// Options shared by every subcommand
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Baud rate of the serial connection
    #[arg(long, global = true, env = "ESPROM_BAUD")]
    pub baud: Option<u32>,
    /// Sections below this address are loaded into RAM, the others execute
    /// from flash
    #[arg(long, global = true, value_parser = parse_u32)]
    pub flash_base: Option<u32>,
    /// Minimum level of log messages
    #[arg(long, global = true, default_value_t = LevelFilter::Info)]
    pub log_level: LevelFilter,
}

/// Values resolved from the command line and the configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub baud: u32,
    pub flash_base: u32,
}

impl Settings {
    /// Command line arguments take precedence over the configuration file
    pub fn resolve(args: &GlobalArgs, config: &Config) -> Self {
        Settings {
            baud: args.baud.unwrap_or(config.connection.baud),
            flash_base: args.flash_base.unwrap_or(config.image.flash_base),
        }
    }
}

/// Download a firmware ELF to RAM and execute it
#[derive(Debug, Args)]
pub struct LoadRamArgs {
    /// Serial port the device is connected to
    pub port: String,
    /// Firmware ELF file
    pub firmware: PathBuf,
}

/// Dump a region of memory to a file
#[derive(Debug, Args)]
pub struct DumpMemArgs {
    /// Serial port the device is connected to
    pub port: String,
    /// Base address
    #[arg(value_parser = parse_u32)]
    pub address: u32,
    /// Size of the region in bytes
    #[arg(value_parser = parse_u32)]
    pub size: u32,
    /// File to write the dump to
    pub file: PathBuf,
}

/// Read a single word of memory
#[derive(Debug, Args)]
pub struct ReadMemArgs {
    /// Serial port the device is connected to
    pub port: String,
    /// Address to read
    #[arg(value_parser = parse_u32)]
    pub address: u32,
}

/// Read-modify-write a single word of memory
#[derive(Debug, Args)]
pub struct WriteMemArgs {
    /// Serial port the device is connected to
    pub port: String,
    /// Address to write
    #[arg(value_parser = parse_u32)]
    pub address: u32,
    /// Value to write
    #[arg(value_parser = parse_u32)]
    pub value: u32,
    /// Mask of the bits to write
    #[arg(value_parser = parse_u32)]
    pub mask: u32,
}

/// Write a firmware ELF to flash
#[derive(Debug, Args)]
pub struct WriteFlashArgs {
    /// Serial port the device is connected to
    pub port: String,
    /// Firmware ELF file
    pub firmware: PathBuf,
}

/// Create a combined flash image from a firmware ELF
#[derive(Debug, Args)]
pub struct MakeImageArgs {
    /// Firmware ELF file
    pub firmware: PathBuf,
    /// File to write the image to
    pub output: PathBuf,
}

/// Create separate RAM and flash images from a firmware ELF
#[derive(Debug, Args)]
pub struct MakeSplitImageArgs {
    /// Firmware ELF file
    pub firmware: PathBuf,
    /// File to write the image of the RAM loaded sections to
    pub ram_output: PathBuf,
    /// File to write the image of the statically mapped sections to
    pub flash_output: PathBuf,
}

/// Run the application already in flash
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Serial port the device is connected to, defaults to the configured
    /// port
    pub port: Option<String>,
    /// Reboot the device instead of jumping to the application
    #[arg(long)]
    pub reboot: bool,
}

/// Print the headers of an application image
#[derive(Debug, Args)]
pub struct ImageInfoArgs {
    /// Image file to parse
    pub file: PathBuf,
}

/// Parse a C-style integer literal
///
/// Hexadecimal literals start with `0x`, octal ones with a leading `0`, and
/// everything else is decimal.
pub fn parse_u32(input: &str) -> Result<u32, ParseIntError> {
    match input.strip_prefix('0') {
        Some(octal) if !octal.is_empty() && octal.bytes().all(|b| b.is_ascii_digit()) => {
            parse_int::parse(&format!("0o{octal}"))
        }
        _ => parse_int::parse(input),
    }
}

/// Progress bar rendering of transfer progress
#[derive(Default)]
pub struct EspromProgress {
    bar: Option<(ProgressStage, ProgressBar)>,
}

impl EspromProgress {
    fn start(event: &ProgressEvent) -> ProgressBar {
        let message = format!("{} @{:#010x}", event.stage, event.address);

        match event.stage {
            ProgressStage::Erasing => ProgressBar::new_spinner().with_message(message),
            _ => ProgressBar::new(event.total as u64)
                .with_style(
                    ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] [{bar:40}] {pos:>7}/{len:7} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=> "),
                )
                .with_message(message),
        }
    }
}

impl ProgressCallbacks for EspromProgress {
    fn update(&mut self, event: ProgressEvent) {
        let restart = match &self.bar {
            Some((stage, _)) => *stage != event.stage || event.done == 0,
            None => true,
        };

        if restart {
            self.finish();
            self.bar = Some((event.stage, Self::start(&event)));
        }

        if let Some((_, bar)) = &self.bar {
            bar.set_position(event.done as u64);
        }
    }

    fn finish(&mut self) {
        if let Some((_, bar)) = self.bar.take() {
            bar.finish();
        }
    }
}

/// Open a serial port at `baud`, 8N1 without flow control
pub fn open_port(port: &str, baud: u32) -> Result<Box<dyn SerialPort>> {
    let serial = serialport::new(port, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(DEFAULT_TIMEOUT)
        .open()
        .map_err(Error::from)
        .wrap_err_with(|| format!("Failed to open serial port {port}"))?;

    Ok(serial)
}

/// Open `port` and perform the bootloader handshake
pub fn connect(port: &str, settings: &Settings) -> Result<Flasher<Box<dyn SerialPort>>> {
    let serial = open_port(port, settings.baud)?;

    println!("Serial port: {port}");
    println!("Connecting...");
    let flasher = Flasher::connect(serial)?;
    println!("Connected.");

    Ok(flasher)
}

/// Read a firmware ELF and split its sections at `flash_base`
pub fn read_elf_image(path: &Path, flash_base: u32) -> Result<Image> {
    let data = fs::read(path).map_err(|e| Error::FileOpen(path.display().to_string(), e))?;
    let elf = FirmwareImage::from_data(&data)?;

    Ok(elf.to_image(flash_base)?)
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", path.display()))
}

pub fn load_ram(args: LoadRamArgs, settings: &Settings) -> Result<()> {
    let image = read_elf_image(&args.firmware, settings.flash_base)?;
    let mut flasher = connect(&args.port, settings)?;

    flasher.load_image_to_ram(&image, Some(&mut EspromProgress::default()))?;
    println!("Executing at {:#010x}", image.entry());

    Ok(())
}

pub fn dump_mem(args: DumpMemArgs, settings: &Settings) -> Result<()> {
    let mut flasher = connect(&args.port, settings)?;

    let data = flasher.dump_mem(
        args.address,
        args.size,
        Some(&mut EspromProgress::default()),
    )?;
    write_file(&args.file, &data)?;
    println!("Wrote {} bytes to {}", data.len(), args.file.display());

    Ok(())
}

pub fn read_mem(args: ReadMemArgs, settings: &Settings) -> Result<()> {
    let mut flasher = connect(&args.port, settings)?;

    let value = flasher.read_reg(args.address)?;
    println!("@{:#010x}: {:#010x}", args.address, value);

    Ok(())
}

pub fn write_mem(args: WriteMemArgs, settings: &Settings) -> Result<()> {
    let mut flasher = connect(&args.port, settings)?;

    flasher.write_reg(args.address, args.value, args.mask, 0)?;
    println!(
        "Wrote {:#010x} with mask {:#010x} to address {:#010x}",
        args.value, args.mask, args.address
    );

    Ok(())
}

pub fn write_flash(args: WriteFlashArgs, settings: &Settings) -> Result<()> {
    let image = read_elf_image(&args.firmware, settings.flash_base)?;
    let mut flasher = connect(&args.port, settings)?;

    flasher.write_image_to_flash(&image, Some(&mut EspromProgress::default()))?;
    println!("Flashing has completed!");

    Ok(())
}

pub fn make_image(args: MakeImageArgs, settings: &Settings) -> Result<()> {
    let image = read_elf_image(&args.firmware, settings.flash_base)?;

    write_file(&args.output, &image.combined_image()?)
}

pub fn make_split_image(args: MakeSplitImageArgs, settings: &Settings) -> Result<()> {
    let image = read_elf_image(&args.firmware, settings.flash_base)?;

    write_file(&args.ram_output, &image.ram_image()?)?;
    let (offset, data) = image.flash_image()?;
    write_file(&args.flash_output, &data)?;
    println!("Static image flash offset: {offset:#x}");

    Ok(())
}

pub fn run(args: RunArgs, settings: &Settings, config: &Config) -> Result<()> {
    let port = args
        .port
        .as_deref()
        .or(config.connection.serial.as_deref())
        .ok_or_else(|| miette::miette!("No serial port given and none configured"))?;
    let mut flasher = connect(port, settings)?;

    flasher.run(args.reboot)?;

    Ok(())
}

pub fn image_info(args: ImageInfoArgs) -> Result<()> {
    let data = fs::read(&args.file)
        .map_err(|e| Error::FileOpen(args.file.display().to_string(), e))?;
    let info = ImageInfo::parse(&data)?;

    println!("Entry point: {:#010x}", info.entry);
    println!("{} segments", info.segments.len());
    println!();
    for (index, segment) in info.segments.iter().enumerate() {
        println!(
            "Segment {}: {:5} bytes at {:#010x}",
            index + 1,
            segment.length,
            segment.address
        );
    }
    println!();
    println!(
        "Checksum: {:#04x} ({})",
        info.checksum,
        if info.checksum_valid() {
            "valid".to_string()
        } else {
            format!("invalid, calculated {:#04x}", info.computed_checksum)
        }
    );

    Ok(())
}
