//! Synthetic PE32+ image mapped into the test process

#![allow(dead_code)]

use mgr_patch_plugin::{
    mem::page_size,
    section::{SectionGuard, SectionUnprotector},
};
use region::{Allocation, Protection};

/// Offset of the PE signature
const PE_POINTER: usize = 0x80;
/// Size of the PE32+ optional header
const OPTIONAL_HEADER_SIZE: usize = 0xF0;
/// Section table entry size
const SECTION_ENTRY_SIZE: usize = 40;

const CODE_CHARACTERISTICS: u32 = 0x6000_0020;
const DATA_CHARACTERISTICS: u32 = 0xC000_0040;
const RDATA_CHARACTERISTICS: u32 = 0x4000_0040;

/// Sections of the image, one page each after the header page
const SECTIONS: [(&str, u32, Protection); 3] = [
    (".text", CODE_CHARACTERISTICS, Protection::READ_EXECUTE),
    (".data", DATA_CHARACTERISTICS, Protection::READ_WRITE),
    (".rdata", RDATA_CHARACTERISTICS, Protection::READ),
];

/// Loaded module image with a header page followed by `.text`, `.data`
/// and `.rdata`, each a single page protected the way a loader would
pub struct TestImage {
    allocation: Allocation,
}

impl TestImage {
    /// Maps the image, copying `code` to the start of `.text`
    pub fn new(code: &[(usize, &[u8])]) -> Self {
        let page = page_size();
        let mut allocation = region::alloc(page * 4, Protection::READ_WRITE).unwrap();
        let base = allocation.as_mut_ptr::<u8>();
        let image = unsafe { std::slice::from_raw_parts_mut(base, page * 4) };

        // Padding outside the patch sites
        image[page..page * 2].fill(0xCC);
        for (offset, bytes) in code {
            let start = page + offset;
            image[start..start + bytes.len()].copy_from_slice(bytes);
        }

        write_headers(image, page);

        unsafe {
            region::protect(base as *const u8, page, Protection::READ).unwrap();
            for (index, (_, _, protection)) in SECTIONS.iter().enumerate() {
                let section = base.add(page * (index + 1)) as *const u8;
                region::protect(section, page, *protection).unwrap();
            }
        }

        Self { allocation }
    }

    /// Opens a section guard over `section` of the image
    pub fn unprotect(&self, section: Option<&str>) -> SectionGuard {
        unsafe { SectionUnprotector::open_for_module(self.base(), section) }.unwrap()
    }

    pub fn base(&self) -> usize {
        self.allocation.as_ptr::<u8>() as usize
    }

    pub fn size(&self) -> usize {
        page_size() * 4
    }

    /// Address of the section at `index` in the section table
    pub fn section(&self, index: usize) -> usize {
        self.base() + page_size() * (index + 1)
    }

    pub fn text(&self) -> usize {
        self.section(0)
    }

    pub fn data(&self) -> usize {
        self.section(1)
    }

    pub fn rdata(&self) -> usize {
        self.section(2)
    }

    pub fn byte(&self, address: usize) -> u8 {
        assert!((self.base()..self.base() + self.size()).contains(&address));
        unsafe { *(address as *const u8) }
    }
}

/// Current protection of the page holding `address`
pub fn protection(address: usize) -> Protection {
    region::query(address as *const u8).unwrap().protection()
}

fn put_u16(image: &mut [u8], offset: usize, value: u16) {
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], offset: usize, value: u32) {
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_headers(image: &mut [u8], page: usize) {
    // DOS header
    image[0..2].copy_from_slice(b"MZ");
    put_u32(image, 0x3C, PE_POINTER as u32);

    // PE signature and COFF header
    image[PE_POINTER..PE_POINTER + 4].copy_from_slice(b"PE\0\0");
    let coff = PE_POINTER + 4;
    put_u16(image, coff, 0x8664);
    put_u16(image, coff + 2, SECTIONS.len() as u16);
    put_u16(image, coff + 16, OPTIONAL_HEADER_SIZE as u16);
    put_u16(image, coff + 18, 0x0022);

    // PE32+ optional header
    let optional = coff + 20;
    put_u16(image, optional, 0x020B);
    put_u32(image, optional + 4, page as u32);
    put_u32(image, optional + 20, page as u32);
    put_u32(image, optional + 32, page as u32);
    put_u32(image, optional + 36, 0x200);
    put_u16(image, optional + 48, 6);
    put_u32(image, optional + 56, (page * 4) as u32);
    put_u32(image, optional + 60, 0x400);
    put_u16(image, optional + 68, 2);
    put_u32(image, optional + 108, 16);

    // Section table
    let table = optional + OPTIONAL_HEADER_SIZE;
    for (index, (name, characteristics, _)) in SECTIONS.iter().enumerate() {
        let entry = table + index * SECTION_ENTRY_SIZE;
        image[entry..entry + name.len()].copy_from_slice(name.as_bytes());
        put_u32(image, entry + 8, page as u32);
        put_u32(image, entry + 12, (page * (index + 1)) as u32);
        put_u32(image, entry + 16, page as u32);
        put_u32(image, entry + 20, (page * (index + 1)) as u32);
        put_u32(image, entry + 36, *characteristics);
    }
}
