//! Firmware image layouts
//!
//! An [Image] splits firmware sections into those the bootloader copies to RAM
//! (loaded sections) and those executed in place from memory-mapped flash
//! (static sections), and serializes them into the byte layouts the ROM
//! expects.

use std::mem::size_of;

use bytemuck::{bytes_of, Pod, Zeroable};
use log::debug;
use xmas_elf::sections::{ShType, SHF_ALLOC};

use crate::{
    checksum::{checksum, CHECKSUM_INIT},
    elf::ElfSection,
    error::{Error, LayoutError},
};

/// First byte of the application image
pub const ESP_MAGIC: u8 = 0xE9;
/// Base address of the SPI flash mapping
pub const DEFAULT_FLASH_BASE: u32 = 0x4020_0000;
/// Value of erased flash, used to fill gaps
const FLASH_FILL: u8 = 0xFF;

#[derive(Zeroable, Pod, Copy, Clone, Debug, Default)]
#[repr(C)]
struct ImageHeader {
    magic: u8,
    segment_count: u8,
    flags: u16,
    entry: u32,
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct SegmentHeader {
    addr: u32,
    length: u32,
}

/// A contiguous block of firmware destined for a fixed address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Section {
    pub fn new(address: u32, data: impl Into<Vec<u8>>) -> Self {
        Section {
            address,
            data: data.into(),
        }
    }
}

/// Where a section ends up on the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
    /// Copied into RAM by the bootloader
    Loaded,
    /// Executed in place from flash
    Static,
}

/// Firmware sections split by destination, plus the entry point
#[derive(Clone, Debug)]
pub struct Image {
    loaded_sections: Vec<Section>,
    static_sections: Vec<Section>,
    entry: u32,
    flash_base: u32,
}

impl Image {
    pub fn new(entry: u32, flash_base: u32) -> Self {
        Image {
            loaded_sections: Vec::new(),
            static_sections: Vec::new(),
            entry,
            flash_base,
        }
    }

    /// Build an image from extracted ELF sections, keeping the allocated
    /// sections with file contents
    pub fn from_sections<'a>(
        sections: impl IntoIterator<Item = ElfSection<'a>>,
        entry: u32,
        flash_base: u32,
    ) -> Self {
        let mut image = Image::new(entry, flash_base);

        for section in sections {
            if section.section_type == ShType::ProgBits && section.flags & SHF_ALLOC != 0 {
                image.add_section(Section::new(section.address, section.data));
            }
        }

        image
    }

    /// Classify a section by its address
    pub fn classify(&self, address: u32) -> SectionKind {
        if address < self.flash_base {
            SectionKind::Loaded
        } else {
            SectionKind::Static
        }
    }

    /// Append a section to the list matching its classification
    pub fn add_section(&mut self, section: Section) {
        let kind = self.classify(section.address);
        debug!(
            "{:?} section: {} bytes @{:#010x}",
            kind,
            section.data.len(),
            section.address
        );

        match kind {
            SectionKind::Loaded => self.loaded_sections.push(section),
            SectionKind::Static => self.static_sections.push(section),
        }
    }

    pub fn loaded_sections(&self) -> &[Section] {
        &self.loaded_sections
    }

    pub fn static_sections(&self) -> &[Section] {
        &self.static_sections
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn flash_base(&self) -> u32 {
        self.flash_base
    }

    /// Image the ROM loads into RAM at boot
    ///
    /// The trailing checksum covers the section data without its alignment
    /// padding.
    pub fn ram_image(&self) -> Result<Vec<u8>, Error> {
        let segment_count = u8::try_from(self.loaded_sections.len())
            .map_err(|_| LayoutError::TooManySections(self.loaded_sections.len()))?;

        let header = ImageHeader {
            magic: ESP_MAGIC,
            segment_count,
            flags: 0,
            entry: self.entry,
        };

        let mut data = Vec::with_capacity(
            size_of::<ImageHeader>()
                + self
                    .loaded_sections
                    .iter()
                    .map(|section| size_of::<SegmentHeader>() + section.data.len() + 3)
                    .sum::<usize>()
                + 16,
        );
        data.extend_from_slice(bytes_of(&header));

        let mut checksum_state = CHECKSUM_INIT;

        for section in &self.loaded_sections {
            let padding = padding_to_word(section.data.len());
            let segment_header = SegmentHeader {
                addr: section.address,
                length: (section.data.len() + padding) as u32,
            };

            data.extend_from_slice(bytes_of(&segment_header));
            data.extend_from_slice(&section.data);
            data.resize(data.len() + padding, 0);

            checksum_state = checksum(&section.data, checksum_state);
        }

        let padding = 15 - data.len() % 16;
        data.resize(data.len() + padding, 0);
        data.push(checksum_state);

        Ok(data)
    }

    /// Flat image of the static sections, with gaps filled by erased flash
    ///
    /// Returns the offset of the image relative to the flash base together
    /// with its contents.
    pub fn flash_image(&self) -> Result<(u32, Vec<u8>), Error> {
        let mut sections: Vec<&Section> = self.static_sections.iter().collect();
        sections.sort_by_key(|section| section.address);

        let base = sections
            .first()
            .map(|section| section.address)
            .ok_or(LayoutError::NoStaticSections)?;

        let mut data = Vec::new();
        for section in sections {
            let offset = (section.address - base) as usize;
            if offset < data.len() {
                return Err(LayoutError::Overlap {
                    address: section.address,
                    end: base + data.len() as u32,
                }
                .into());
            }

            data.resize(offset, FLASH_FILL);
            data.extend_from_slice(&section.data);
        }

        Ok((base - self.flash_base, data))
    }

    /// The RAM image followed by the static image at its flash offset
    pub fn combined_image(&self) -> Result<Vec<u8>, Error> {
        let mut data = self.ram_image()?;
        let (offset, static_data) = self.flash_image()?;

        if (offset as usize) < data.len() {
            return Err(LayoutError::CombinedOverlap {
                offset,
                ram_len: data.len(),
            }
            .into());
        }

        data.resize(offset as usize, FLASH_FILL);
        data.extend_from_slice(&static_data);

        Ok(data)
    }
}

/// Zero bytes needed to round `len` up to a multiple of four
fn padding_to_word(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// A section as described by a RAM image header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    pub address: u32,
    pub length: u32,
}

/// Headers decoded from a RAM image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub entry: u32,
    pub flags: u16,
    pub segments: Vec<SegmentInfo>,
    /// Checksum stored in the image trailer
    pub checksum: u8,
    /// Checksum computed over the segment data
    pub computed_checksum: u8,
}

impl ImageInfo {
    /// Decode the headers of a RAM image, as produced by [Image::ram_image]
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let header_len = size_of::<ImageHeader>();
        if data.len() < header_len {
            return Err(Error::InvalidImage(format!(
                "{} bytes is too short for an image header",
                data.len()
            )));
        }

        let header: ImageHeader = bytemuck::pod_read_unaligned(&data[..header_len]);
        if header.magic != ESP_MAGIC {
            return Err(Error::InvalidImage(format!(
                "invalid magic {:#04x}, expected {:#04x}",
                header.magic, ESP_MAGIC
            )));
        }

        let mut offset = header_len;
        let mut segments = Vec::with_capacity(header.segment_count as usize);
        let mut computed_checksum = CHECKSUM_INIT;

        for index in 0..header.segment_count {
            let header_end = offset + size_of::<SegmentHeader>();
            let segment_header: SegmentHeader = data
                .get(offset..header_end)
                .map(bytemuck::pod_read_unaligned)
                .ok_or_else(|| {
                    Error::InvalidImage(format!("segment {} header is truncated", index))
                })?;

            let segment_data = data
                .get(header_end..header_end + segment_header.length as usize)
                .ok_or_else(|| {
                    Error::InvalidImage(format!(
                        "segment {} declares {} bytes past the end of the image",
                        index, segment_header.length
                    ))
                })?;

            // zero padding leaves the XOR checksum unchanged
            computed_checksum = checksum(segment_data, computed_checksum);
            segments.push(SegmentInfo {
                address: segment_header.addr,
                length: segment_header.length,
            });
            offset = header_end + segment_data.len();
        }

        let checksum_offset = offset + 15 - offset % 16;
        let checksum = *data.get(checksum_offset).ok_or_else(|| {
            Error::InvalidImage("image is missing its checksum byte".to_string())
        })?;

        Ok(ImageInfo {
            entry: header.entry,
            flags: header.flags,
            segments,
            checksum,
            computed_checksum,
        })
    }

    pub fn checksum_valid(&self) -> bool {
        self.checksum == self.computed_checksum
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const ENTRY: u32 = 0x4010_0008;

    fn elf_section(address: u32, data: &[u8], section_type: ShType, flags: u64) -> ElfSection<'_> {
        ElfSection {
            address,
            data,
            section_type,
            flags,
        }
    }

    #[test]
    fn sections_are_classified_by_flash_base() {
        let mut image = Image::new(ENTRY, DEFAULT_FLASH_BASE);
        image.add_section(Section::new(0x3FFE_8000, vec![1; 4]));
        image.add_section(Section::new(0x4020_0000, vec![2; 4]));
        image.add_section(Section::new(0x4010_0000, vec![3; 4]));
        image.add_section(Section::new(0x4024_0000, vec![4; 4]));

        let addresses = |sections: &[Section]| {
            sections
                .iter()
                .map(|section| section.address)
                .collect::<Vec<_>>()
        };
        assert_eq!(
            addresses(image.loaded_sections()),
            [0x3FFE_8000, 0x4010_0000]
        );
        assert_eq!(
            addresses(image.static_sections()),
            [0x4020_0000, 0x4024_0000]
        );
        assert_eq!(image.classify(DEFAULT_FLASH_BASE - 1), SectionKind::Loaded);
    }

    #[test]
    fn only_allocated_progbits_sections_are_kept() {
        let text = [0xAA; 8];
        let comment = [0xBB; 8];
        let sections = vec![
            elf_section(0x4010_0000, &text, ShType::ProgBits, SHF_ALLOC),
            elf_section(0, &comment, ShType::ProgBits, 0),
            elf_section(0x3FFE_8000, &[], ShType::NoBits, SHF_ALLOC),
            elf_section(0, &comment, ShType::StrTab, 0),
        ];

        let image = Image::from_sections(sections, ENTRY, DEFAULT_FLASH_BASE);

        assert_eq!(
            image.loaded_sections(),
            [Section::new(0x4010_0000, text.to_vec())]
        );
        assert!(image.static_sections().is_empty());
        assert_eq!(image.entry(), ENTRY);
    }

    #[test]
    fn ram_image_layout() {
        let data = [0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17];
        let mut image = Image::new(ENTRY, DEFAULT_FLASH_BASE);
        image.add_section(Section::new(0x4010_0000, data.to_vec()));

        let ram = image.ram_image().unwrap();

        let mut expected = vec![0xE9, 0x01, 0x00, 0x00, 0x08, 0x00, 0x10, 0x40];
        expected.extend_from_slice(&[0x00, 0x00, 0x10, 0x40, 0x08, 0x00, 0x00, 0x00]);
        expected.extend_from_slice(&data);
        expected.extend_from_slice(&[0; 7]);
        expected.push(checksum(&data, CHECKSUM_INIT));

        assert_eq!(ram, expected);
    }

    #[test]
    fn ram_image_pads_sections_to_words() {
        let mut image = Image::new(0, DEFAULT_FLASH_BASE);
        image.add_section(Section::new(0x3FFE_8000, vec![0xFF; 5]));
        image.add_section(Section::new(0x4010_0000, vec![0x01; 3]));

        let ram = image.ram_image().unwrap();

        assert_eq!(ram[1], 2);
        // first segment: 5 bytes padded to 8
        assert_eq!(&ram[8..16], [0x00, 0x80, 0xFE, 0x3F, 8, 0, 0, 0]);
        assert_eq!(&ram[16..24], [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0]);
        // second segment: 3 bytes padded to 4
        assert_eq!(&ram[24..32], [0x00, 0x00, 0x10, 0x40, 4, 0, 0, 0]);
        assert_eq!(&ram[32..36], [0x01, 0x01, 0x01, 0x00]);
        assert_eq!(ram.len(), 48);
        assert_eq!(ram[47], CHECKSUM_INIT ^ 0xFF ^ 0x01);
    }

    #[test]
    fn ram_image_length_is_a_multiple_of_sixteen() {
        for len in 0..40 {
            let mut image = Image::new(ENTRY, DEFAULT_FLASH_BASE);
            image.add_section(Section::new(0x4010_0000, vec![0x5A; len]));
            if len % 3 == 0 {
                image.add_section(Section::new(0x3FFE_8000, vec![0xA5; len / 3]));
            }

            assert_eq!(image.ram_image().unwrap().len() % 16, 0, "len {len}");
        }

        let empty = Image::new(0, DEFAULT_FLASH_BASE).ram_image().unwrap();
        assert_eq!(empty.len(), 16);
        assert_eq!(empty[15], CHECKSUM_INIT);
    }

    #[test]
    fn too_many_sections_do_not_fit_the_header() {
        let mut image = Image::new(0, DEFAULT_FLASH_BASE);
        for i in 0..256 {
            image.add_section(Section::new(i * 4, vec![0; 4]));
        }

        let err = image.ram_image().unwrap_err();
        assert!(matches!(
            err,
            Error::Layout(LayoutError::TooManySections(256))
        ));
    }

    #[test]
    fn flash_image_fills_gaps_with_erased_flash() {
        let mut image = Image::new(ENTRY, DEFAULT_FLASH_BASE);
        image.add_section(Section::new(0x4020_2000, vec![5, 6, 7, 8]));
        image.add_section(Section::new(0x4020_1000, vec![1, 2, 3, 4]));

        let (offset, data) = image.flash_image().unwrap();

        assert_eq!(offset, 0x1000);
        assert_eq!(data.len(), 4 + 4092 + 4);
        assert_eq!(&data[..4], [1, 2, 3, 4]);
        assert!(data[4..4096].iter().all(|&b| b == 0xFF));
        assert_eq!(&data[4096..], [5, 6, 7, 8]);
    }

    #[test]
    fn flash_image_rejects_overlap() {
        let mut image = Image::new(0, 0);
        image.add_section(Section::new(0x1000, vec![0; 16]));
        image.add_section(Section::new(0x1008, vec![0; 16]));

        let err = image.flash_image().unwrap_err();
        assert!(matches!(
            err,
            Error::Layout(LayoutError::Overlap {
                address: 0x1008,
                end: 0x1010
            })
        ));
    }

    #[test]
    fn flash_image_needs_static_sections() {
        let mut image = Image::new(0, DEFAULT_FLASH_BASE);
        image.add_section(Section::new(0x4010_0000, vec![0; 4]));

        let err = image.flash_image().unwrap_err();
        assert!(matches!(err, Error::Layout(LayoutError::NoStaticSections)));
    }

    #[test]
    fn combined_image_places_static_data_at_its_offset() {
        let mut image = Image::new(ENTRY, DEFAULT_FLASH_BASE);
        image.add_section(Section::new(0x4010_0000, vec![0x11; 8]));
        image.add_section(Section::new(0x4020_0100, vec![0x22; 4]));

        let ram = image.ram_image().unwrap();
        let combined = image.combined_image().unwrap();

        assert_eq!(combined.len(), 0x104);
        assert_eq!(&combined[..ram.len()], ram.as_slice());
        assert!(combined[ram.len()..0x100].iter().all(|&b| b == 0xFF));
        assert_eq!(&combined[0x100..], [0x22; 4]);
    }

    #[test]
    fn combined_image_rejects_static_data_inside_ram_image() {
        let mut image = Image::new(ENTRY, DEFAULT_FLASH_BASE);
        image.add_section(Section::new(0x4010_0000, vec![0x11; 64]));
        image.add_section(Section::new(0x4020_0010, vec![0x22; 4]));

        let err = image.combined_image().unwrap_err();
        assert!(matches!(
            err,
            Error::Layout(LayoutError::CombinedOverlap {
                offset: 0x10,
                ram_len: 96
            })
        ));
    }

    #[test]
    fn image_info_reads_back_headers() {
        let mut image = Image::new(ENTRY, DEFAULT_FLASH_BASE);
        image.add_section(Section::new(0x3FFE_8000, vec![0x42; 6]));
        image.add_section(Section::new(0x4010_0000, vec![0x17; 12]));

        let info = ImageInfo::parse(&image.ram_image().unwrap()).unwrap();

        assert_eq!(info.entry, ENTRY);
        assert_eq!(
            info.segments,
            [
                SegmentInfo {
                    address: 0x3FFE_8000,
                    length: 8
                },
                SegmentInfo {
                    address: 0x4010_0000,
                    length: 12
                },
            ]
        );
        assert!(info.checksum_valid());
    }

    #[test]
    fn image_info_detects_corruption() {
        let mut image = Image::new(ENTRY, DEFAULT_FLASH_BASE);
        image.add_section(Section::new(0x4010_0000, vec![0x17; 12]));
        let mut ram = image.ram_image().unwrap();

        ram[20] ^= 0x01;
        assert!(!ImageInfo::parse(&ram).unwrap().checksum_valid());

        ram[0] = 0xEA;
        assert!(matches!(
            ImageInfo::parse(&ram),
            Err(Error::InvalidImage(_))
        ));

        let truncated = &image.ram_image().unwrap()[..20];
        assert!(matches!(
            ImageInfo::parse(truncated),
            Err(Error::InvalidImage(_))
        ));
    }
}
