//! Protection backend for non Windows hosts built on the `region` crate

use crate::error::{PatchError, Result};
use log::error;
use region::Protection;

pub type RawProtection = Protection;

pub const READ_WRITE_EXECUTE: RawProtection = Protection::READ_WRITE_EXECUTE;

pub fn page_size() -> usize {
    region::page::size()
}

pub fn is_writable(protection: RawProtection) -> bool {
    protection.contains(Protection::WRITE)
}

fn error_code(err: &region::Error) -> u32 {
    match err {
        region::Error::SystemCall(err) => err.raw_os_error().unwrap_or_default() as u32,
        _ => 0,
    }
}

/// Queries the mapped region containing `address`, providing the end of
/// the region and its current protection. Fails with the OS error code,
/// zero when the address is not mapped
pub fn query(address: usize) -> std::result::Result<(usize, RawProtection), u32> {
    let found = region::query(address as *const u8).map_err(|err| error_code(&err))?;
    Ok((found.as_range().end, found.protection()))
}

/// Applies `protection` to the pages covering `address..address + length`
///
/// ## Safety
///
/// Changing protection of memory in use by other code can make it fault
pub unsafe fn protect(address: usize, length: usize, protection: RawProtection) -> Result<()> {
    region::protect(address as *const u8, length, protection).map_err(|err| {
        error!(
            "Failed to protect memory region @ {:#016x} length {} error: {}",
            address, length, err
        );

        PatchError::ProtectionChangeFailed {
            address,
            length,
            code: error_code(&err),
        }
    })
}
