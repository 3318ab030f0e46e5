use xmas_elf::{
    sections::{SectionData, ShType},
    ElfFile,
};

use crate::{
    error::{ElfError, Error},
    image_format::Image,
};

/// A parsed ELF file
pub struct FirmwareImage<'a> {
    elf: ElfFile<'a>,
}

impl<'a> FirmwareImage<'a> {
    pub fn from_data(data: &'a [u8]) -> Result<Self, Error> {
        let elf = ElfFile::new(data).map_err(ElfError::from)?;
        Ok(Self::from_elf(elf))
    }

    pub fn from_elf(elf: ElfFile<'a>) -> Self {
        FirmwareImage { elf }
    }

    pub fn entry(&self) -> u32 {
        self.elf.header.pt2.entry_point() as u32
    }

    /// Every section of the file with its address, type and flags
    ///
    /// Sections without file contents have empty data. A section whose type
    /// is unknown, or whose contents lie outside the file, is an error.
    pub fn sections(&self) -> impl Iterator<Item = Result<ElfSection<'a>, Error>> + '_ {
        self.elf.section_iter().map(move |header| -> Result<ElfSection<'a>, Error> {
            let section_type = header.get_type().map_err(ElfError::from)?;
            let data = match section_type {
                ShType::ProgBits => {
                    let end = header.offset().checked_add(header.size());
                    if end.is_none_or(|end| end > self.elf.input.len() as u64) {
                        return Err(ElfError::from("section data lies outside the file").into());
                    }

                    match header.get_data(&self.elf).map_err(ElfError::from)? {
                        SectionData::Undefined(data) => data,
                        _ => return Err(ElfError::from("unexpected PROGBITS section data").into()),
                    }
                }
                _ => &[],
            };

            Ok(ElfSection {
                address: header.address() as u32,
                data,
                section_type,
                flags: header.flags(),
            })
        })
    }

    /// Build an image from the allocated sections of this file
    pub fn to_image(&self, flash_base: u32) -> Result<Image, Error> {
        let sections = self.sections().collect::<Result<Vec<_>, _>>()?;

        Ok(Image::from_sections(sections, self.entry(), flash_base))
    }
}

/// A section extracted from an ELF file
#[derive(Clone, Copy, Debug)]
pub struct ElfSection<'a> {
    pub address: u32,
    pub data: &'a [u8],
    pub section_type: ShType,
    pub flags: u64,
}
