//! Windows protection backend built on `VirtualQuery` / `VirtualProtect`

use crate::error::{PatchError, Result};
use log::error;
use std::{ffi::c_void, mem::size_of};
use windows_sys::Win32::{
    Foundation::{GetLastError, ERROR_INVALID_ADDRESS, FALSE},
    System::{
        Memory::{
            VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
            PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
            PAGE_WRITECOPY,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    },
};

pub type RawProtection = PAGE_PROTECTION_FLAGS;

pub const READ_WRITE_EXECUTE: RawProtection = PAGE_EXECUTE_READWRITE;

/// Modifier bits (PAGE_GUARD, PAGE_NOCACHE, ...) live above the low byte
const ACCESS_MASK: RawProtection = 0xFF;

pub fn page_size() -> usize {
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

pub fn is_writable(protection: RawProtection) -> bool {
    matches!(
        protection & ACCESS_MASK,
        PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
    )
}

/// Queries the committed region containing `address`, providing the end of
/// the region and its current protection. Fails with the OS error code
pub fn query(address: usize) -> std::result::Result<(usize, RawProtection), u32> {
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };

    let written = unsafe {
        VirtualQuery(
            address as *const c_void,
            &mut info,
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };

    if written == 0 {
        return Err(unsafe { GetLastError() });
    }

    if info.State != MEM_COMMIT {
        return Err(ERROR_INVALID_ADDRESS);
    }

    let end = info.BaseAddress as usize + info.RegionSize;
    Ok((end, info.Protect))
}

/// Applies `protection` to the pages covering `address..address + length`
///
/// ## Safety
///
/// Changing protection of memory in use by other code can make it fault
pub unsafe fn protect(address: usize, length: usize, protection: RawProtection) -> Result<()> {
    // Tmp variable to store the old state
    let mut old_protect: PAGE_PROTECTION_FLAGS = 0;

    if VirtualProtect(address as *const c_void, length, protection, &mut old_protect) == FALSE {
        let code = GetLastError();

        error!(
            "Failed to protect memory region @ {:#016x} length {} error: {:#4x}",
            address, length, code
        );

        return Err(PatchError::ProtectionChangeFailed {
            address,
            length,
            code,
        });
    }

    Ok(())
}
