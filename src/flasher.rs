//! Write a binary application to a target device
//!
//! The [Flasher] struct abstracts over the various operations for writing a
//! binary application to the RAM or flash of a target device, on top of an
//! established [Connection].

use log::{debug, info, warn};

use crate::{
    command::{
        BodyCheck,
        Command,
        CommandType,
        FLASH_BLOCK_SIZE,
        FLASH_END_ALT_BODY,
        RAM_BLOCK_SIZE,
    },
    connection::{Connection, Port},
    error::{Error, LayoutError, ProtocolError, ResultExt},
    image_format::{Image, Section},
    progress::{self, ProgressCallbacks, ProgressEvent, ProgressStage},
};

/// Progress is reported once per this many bytes of a memory dump
const DUMP_PROGRESS_INTERVAL: usize = 1024;

/// Fail if `size` bytes starting at `address` do not fit below `2^32`
fn check_region(address: u32, size: usize) -> Result<(), Error> {
    if u64::from(address) + size as u64 > 1 << 32 {
        return Err(LayoutError::AddressOverflow { address, size }.into());
    }

    Ok(())
}

/// Connect to and flash a target device
pub struct Flasher<P: Port> {
    connection: Connection<P>,
}

impl<P: Port> Flasher<P> {
    /// Perform the bootloader handshake on `port` and wrap the resulting
    /// connection
    pub fn connect(port: P) -> Result<Self, Error> {
        let mut connection = Connection::new(port);
        connection.connect()?;

        Ok(Flasher::new(connection))
    }

    /// Wrap a connection on which the handshake was already performed
    pub fn new(connection: Connection<P>) -> Self {
        Flasher { connection }
    }

    /// The underlying connection
    pub fn connection(&mut self) -> &mut Connection<P> {
        &mut self.connection
    }

    pub fn into_connection(self) -> Connection<P> {
        self.connection
    }

    /// Read and return the value of a register
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        self.connection.read_reg(address)
    }

    /// Write a register, only touching the bits set in `mask`
    pub fn write_reg(
        &mut self,
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    ) -> Result<(), Error> {
        self.connection.write_reg(address, value, mask, delay_us)
    }

    /// Download sections to RAM, then leave the bootloader
    ///
    /// An `entry` of zero stays in the bootloader instead of jumping to the
    /// downloaded code.
    pub fn download_to_ram<'s>(
        &mut self,
        sections: impl IntoIterator<Item = &'s Section>,
        entry: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        for (index, section) in sections.into_iter().enumerate() {
            info!(
                "Uploading section {}: {} bytes @{:#010x}",
                index,
                section.data.len(),
                section.address
            );
            self.download_section(section, &mut progress)?;
        }

        info!("All sections done, executing at {:#010x}", entry);
        self.connection.simple_command(Command::MemEnd { entry })?;
        progress::finish(&mut progress);

        Ok(())
    }

    fn download_section(
        &mut self,
        section: &Section,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let total = section.data.len();
        check_region(section.address, total)?;
        let blocks = total.div_ceil(RAM_BLOCK_SIZE);

        self.connection.simple_command(Command::MemBegin {
            size: total as u32,
            blocks: blocks as u32,
            // RAM downloads declare 0x1800 byte blocks, as the ROM expects.
            // The fixed 0x400 geometry applies to flash begin only.
            block_size: RAM_BLOCK_SIZE as u32,
            offset: section.address,
        })?;

        for (sequence, block) in section.data.chunks(RAM_BLOCK_SIZE).enumerate() {
            let done = sequence * RAM_BLOCK_SIZE;
            progress::report(
                progress,
                ProgressEvent {
                    stage: ProgressStage::Uploading,
                    address: section.address.wrapping_add(done as u32),
                    done,
                    total,
                },
            );

            self.connection.simple_command(Command::MemData {
                data: block,
                sequence: sequence as u32,
            })?;
        }

        Ok(())
    }

    /// Erase the region at `offset` and write `data` to it
    ///
    /// The flash is left in write mode, [Flasher::finish_flash] has to be
    /// called once all regions are written.
    pub fn write_flash(
        &mut self,
        offset: u32,
        data: &[u8],
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        self.write_flash_region(offset, data, &mut progress)?;
        progress::finish(&mut progress);

        Ok(())
    }

    fn write_flash_region(
        &mut self,
        offset: u32,
        data: &[u8],
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let total = data.len();
        check_region(offset, total)?;

        info!("Erasing flash...");
        progress::report(
            progress,
            ProgressEvent {
                stage: ProgressStage::Erasing,
                address: offset,
                done: 0,
                total,
            },
        );
        self.flash_begin(total as u32, offset)?;

        for (sequence, block) in data.chunks(FLASH_BLOCK_SIZE).enumerate() {
            let done = sequence * FLASH_BLOCK_SIZE;
            progress::report(
                progress,
                ProgressEvent {
                    stage: ProgressStage::Writing,
                    address: offset.wrapping_add(done as u32),
                    done,
                    total,
                },
            );

            self.connection.simple_command(Command::FlashData {
                data: block,
                sequence: sequence as u32,
            })?;
        }

        Ok(())
    }

    /// Start a flash write, erasing `size` bytes at `offset`
    fn flash_begin(&mut self, size: u32, offset: u32) -> Result<(), Error> {
        let command = Command::FlashBegin { size, offset };
        let ty = command.command_type();

        match ty.timeout() {
            Some(timeout) => {
                let mut connection = self.connection.timeout_guard(timeout).for_command(ty)?;
                connection.simple_command(command)?;
            }
            None => {
                self.connection.simple_command(command)?;
            }
        }

        Ok(())
    }

    /// Leave flash write mode, rebooting the device if `reboot` is set
    pub fn finish_flash(&mut self, reboot: bool) -> Result<(), Error> {
        let command = Command::FlashEnd { reboot };
        let ty = command.command_type();
        let response = self.connection.command(command)?;

        match ty.response_shape().check(&response.body) {
            BodyCheck::Accepted => {
                if response.body == FLASH_END_ALT_BODY {
                    warn!(
                        "Flash end answered with {:02x?}, treating it as success",
                        response.body
                    );
                }
                Ok(())
            }
            BodyCheck::UnexpectedBody(body) => {
                Err(ProtocolError::UnexpectedBody { command: ty, body }.into())
            }
        }
    }

    /// Leave the bootloader and run the application already in flash
    pub fn run(&mut self, reboot: bool) -> Result<(), Error> {
        self.flash_begin(0, 0)?;
        self.finish_flash(reboot)
    }

    /// Read `size` bytes of memory starting at `address`, one word at a time
    ///
    /// A size which is not a multiple of four is rounded up to whole words.
    /// A range which runs past the end of the address space is rejected
    /// before anything is read.
    pub fn dump_mem(
        &mut self,
        address: u32,
        size: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<Vec<u8>, Error> {
        let total = size as usize;
        let words = total.div_ceil(4);
        check_region(address, words * 4)?;
        let mut data = Vec::with_capacity(words * 4);

        for index in 0..words {
            let word_address = address.wrapping_add((index * 4) as u32);
            let value = self.read_reg(word_address)?;
            data.extend_from_slice(&value.to_le_bytes());

            if data.len() % DUMP_PROGRESS_INTERVAL == 0 {
                let done = data.len();
                progress::report(
                    &mut progress,
                    ProgressEvent {
                        stage: ProgressStage::Reading,
                        address: address.wrapping_add((done - DUMP_PROGRESS_INTERVAL) as u32),
                        done,
                        total,
                    },
                );
            }
        }

        debug!("Read {} bytes from {:#010x}", data.len(), address);
        progress::finish(&mut progress);

        Ok(data)
    }

    /// Download every section of `image` to RAM and jump to its entry point
    pub fn load_image_to_ram(
        &mut self,
        image: &Image,
        progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let sections = image
            .loaded_sections()
            .iter()
            .chain(image.static_sections());

        self.download_to_ram(sections, image.entry(), progress)
    }

    /// Write the RAM image to the start of flash and the static image to its
    /// flash offset, then reboot into it
    pub fn write_image_to_flash(
        &mut self,
        image: &Image,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let ram_image = image.ram_image()?;
        self.write_flash_region(0, &ram_image, &mut progress)?;

        if image.static_sections().is_empty() {
            debug!("Image has no static sections");
        } else {
            let (offset, static_image) = image.flash_image()?;
            info!("Static image flash offset: {:#010x}", offset);
            self.write_flash_region(offset, &static_image, &mut progress)?;
        }

        self.finish_flash(true)?;
        progress::finish(&mut progress);

        Ok(())
    }
}
