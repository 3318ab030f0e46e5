//! Minimal 32-bit little-endian ELF writer for tests
#![allow(dead_code)]

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_NOBITS: u32 = 8;
pub const SHF_ALLOC: u32 = 0x2;
pub const SHF_EXECINSTR: u32 = 0x4;

const EHDR_SIZE: usize = 52;
const SHDR_SIZE: usize = 40;
const EM_XTENSA: u16 = 94;

pub struct TestSection<'a> {
    pub name: &'a str,
    pub kind: u32,
    pub flags: u32,
    pub address: u32,
    pub data: &'a [u8],
}

/// Build an executable ELF holding `sections` and no program headers
pub fn build_elf(entry: u32, sections: &[TestSection]) -> Vec<u8> {
    let mut body = Vec::new();
    let mut names = vec![0u8];
    let mut headers = vec![[0u32; 10]];

    for section in sections {
        let name = names.len() as u32;
        names.extend_from_slice(section.name.as_bytes());
        names.push(0);

        let offset = (EHDR_SIZE + body.len()) as u32;
        if section.kind != SHT_NOBITS {
            body.extend_from_slice(section.data);
        }

        headers.push([
            name,
            section.kind,
            section.flags,
            section.address,
            offset,
            section.data.len() as u32,
            0,
            0,
            1,
            0,
        ]);
    }

    let shstrtab_name = names.len() as u32;
    names.extend_from_slice(b".shstrtab\0");
    let shstrtab_offset = (EHDR_SIZE + body.len()) as u32;
    body.extend_from_slice(&names);
    headers.push([
        shstrtab_name,
        SHT_STRTAB,
        0,
        0,
        shstrtab_offset,
        names.len() as u32,
        0,
        0,
        1,
        0,
    ]);

    while body.len() % 4 != 0 {
        body.push(0);
    }
    let shoff = (EHDR_SIZE + body.len()) as u32;

    let mut elf = vec![0x7F, b'E', b'L', b'F', 1, 1, 1, 0];
    elf.extend_from_slice(&[0; 8]);
    elf.extend_from_slice(&2u16.to_le_bytes());
    elf.extend_from_slice(&EM_XTENSA.to_le_bytes());
    elf.extend_from_slice(&1u32.to_le_bytes());
    elf.extend_from_slice(&entry.to_le_bytes());
    elf.extend_from_slice(&0u32.to_le_bytes());
    elf.extend_from_slice(&shoff.to_le_bytes());
    elf.extend_from_slice(&0u32.to_le_bytes());
    elf.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&32u16.to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes());
    elf.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(headers.len() as u16).to_le_bytes());
    elf.extend_from_slice(&((headers.len() - 1) as u16).to_le_bytes());
    assert_eq!(elf.len(), EHDR_SIZE);

    elf.extend_from_slice(&body);
    for header in headers {
        for field in header {
            elf.extend_from_slice(&field.to_le_bytes());
        }
    }

    elf
}

/// Firmware with one RAM section, one flash section and sections which are
/// not part of the image
pub fn firmware_elf() -> Vec<u8> {
    build_elf(
        0x4010_0004,
        &[
            TestSection {
                name: ".text",
                kind: SHT_PROGBITS,
                flags: SHF_ALLOC | SHF_EXECINSTR,
                address: 0x4010_0000,
                data: &[0x11; 10],
            },
            TestSection {
                name: ".bss",
                kind: SHT_NOBITS,
                flags: SHF_ALLOC,
                address: 0x3FFE_8000,
                data: &[0; 64],
            },
            TestSection {
                name: ".irom0.text",
                kind: SHT_PROGBITS,
                flags: SHF_ALLOC | SHF_EXECINSTR,
                address: 0x4021_0000,
                data: &[0x22; 8],
            },
            TestSection {
                name: ".comment",
                kind: SHT_PROGBITS,
                flags: 0,
                address: 0,
                data: b"GCC",
            },
        ],
    )
}
