//! Module for unprotecting the code of a loaded module for a whole patch pass

use crate::{
    error::{PatchError, Result},
    mem::{self, ProtectionScope},
    pattern::SearchRange,
};
use goblin::pe::{
    header::{Header, SIZEOF_COFF_HEADER, SIZEOF_PE_MAGIC},
    section_table::{IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_WRITE},
};
use log::{debug, warn};
use std::ops::Range;

/// Section of a loaded module image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDescriptor {
    /// The section name from the section table (e.g. `.text`)
    pub name: String,
    /// Absolute address of the loaded section
    pub base: usize,
    /// Size of the section once loaded
    pub size: usize,
    /// Raw `IMAGE_SCN_*` characteristics
    pub characteristics: u32,
}

impl SectionDescriptor {
    pub fn range(&self) -> Range<usize> {
        self.base..self.base + self.size
    }

    /// Whether the section holds code
    pub fn is_code(&self) -> bool {
        self.characteristics & (IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE) != 0
    }

    /// Whether the linker marked the section writable
    pub fn is_writable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_WRITE != 0
    }
}

/// Layout of a loaded module read from its PE header
#[derive(Debug, Clone)]
pub struct ModuleImage {
    /// Address the module is loaded at
    pub base: usize,
    /// `SizeOfImage` from the optional header
    pub size: usize,
    /// Sections in section table order
    pub sections: Vec<SectionDescriptor>,
}

impl ModuleImage {
    /// Finds a section by its exact name
    pub fn section(&self, name: &str) -> Option<&SectionDescriptor> {
        self.sections.iter().find(|section| section.name == name)
    }

    pub fn range(&self) -> Range<usize> {
        self.base..self.base + self.size
    }
}

/// Reads the PE header of the module loaded at `module_base`
///
/// ## Safety
///
/// `module_base` must be the base of a module mapped into this process,
/// its first page must be readable
pub unsafe fn parse_image(module_base: usize) -> Result<ModuleImage> {
    // Headers of a loaded image fit within its first page
    let header_bytes = std::slice::from_raw_parts(module_base as *const u8, mem::page_size());

    let header = Header::parse(header_bytes)
        .map_err(|err| PatchError::InvalidImage(err.to_string()))?;

    let size = header
        .optional_header
        .as_ref()
        .map(|optional| optional.windows_fields.size_of_image as usize)
        .ok_or_else(|| PatchError::InvalidImage("missing optional header".to_string()))?;

    let mut offset = header.dos_header.pe_pointer as usize
        + SIZEOF_PE_MAGIC
        + SIZEOF_COFF_HEADER
        + header.coff_header.size_of_optional_header as usize;

    let sections = header
        .coff_header
        .sections(header_bytes, &mut offset)
        .map_err(|err| PatchError::InvalidImage(err.to_string()))?
        .into_iter()
        .map(|section| {
            let name = section.name().unwrap_or_default().to_string();
            // Sections with no virtual size occupy their raw size
            let size = match section.virtual_size {
                0 => section.size_of_raw_data,
                size => size,
            };

            SectionDescriptor {
                name,
                base: module_base + section.virtual_address as usize,
                size: size as usize,
                characteristics: section.characteristics,
            }
        })
        .collect();

    Ok(ModuleImage {
        base: module_base,
        size,
        sections,
    })
}

/// Opens write access over the code of a loaded module
pub struct SectionUnprotector;

impl SectionUnprotector {
    /// Makes the named section of the module at `module_base` writable until
    /// the returned guard is dropped. When the section is already writable
    /// the guard does nothing. When no name is provided, or the module has no
    /// section by that name, every non-writable part of the whole image is
    /// unprotected instead
    ///
    /// ## Safety
    ///
    /// `module_base` must be the base of a module mapped into this process
    /// and no other thread may execute its code while the guard is alive
    ///
    /// ## Arguments
    /// * module_base - The base address of the loaded module
    /// * section     - The section to unprotect, `.text` for code
    pub unsafe fn open_for_module(
        module_base: usize,
        section: Option<&str>,
    ) -> Result<SectionGuard> {
        let image = parse_image(module_base)?;

        let located = section.and_then(|name| image.section(name)).cloned();
        let mut scopes = Vec::new();

        let range = match located {
            Some(section) => {
                if section.size == 0 {
                    return Err(PatchError::InvalidImage(format!(
                        "section {} is empty",
                        section.name
                    )));
                }

                let writable = mem::settled_protection_runs(section.base, section.size)?
                    .iter()
                    .all(|(_, protection)| mem::is_writable(*protection));

                if writable {
                    debug!("Section {} is already writable", section.name);
                } else {
                    scopes.push(ProtectionScope::open(section.base, section.size)?);
                    debug!(
                        "Unprotected section {} @ {:#016x} length {}",
                        section.name, section.base, section.size
                    );
                }

                section.range()
            }
            None => {
                if let Some(name) = section {
                    warn!("Module has no {} section, unprotecting the whole image", name);
                }

                for (run, protection) in mem::settled_protection_runs(image.base, image.size)? {
                    if mem::is_writable(protection) {
                        continue;
                    }
                    scopes.push(ProtectionScope::open(run.start, run.end - run.start)?);
                }

                debug!(
                    "Unprotected {} regions of module @ {:#016x} length {}",
                    scopes.len(),
                    image.base,
                    image.size
                );

                image.range()
            }
        };

        Ok(SectionGuard {
            image,
            range,
            scopes,
        })
    }
}

/// Write access to a module region, restored when dropped
#[must_use = "protection is restored as soon as the guard is dropped"]
pub struct SectionGuard {
    image: ModuleImage,
    range: Range<usize>,
    scopes: Vec<ProtectionScope>,
}

impl SectionGuard {
    pub fn sections(&self) -> &[SectionDescriptor] {
        &self.image.sections
    }

    /// The section (or whole image) covered by the guard
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Whether the region was already writable and nothing was changed
    pub fn is_noop(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Range for scanning the covered region
    pub fn search_range(&self) -> Result<SearchRange<'_>> {
        // Safety: The range lies within the loaded image
        unsafe { SearchRange::from_raw(self.range.start, self.range.end - self.range.start) }
    }

    /// Restores the original protection, reporting the first failure
    pub fn restore(mut self) -> Result<()> {
        let mut result = Ok(());
        while let Some(scope) = self.scopes.pop() {
            if let Err(err) = scope.restore() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}
