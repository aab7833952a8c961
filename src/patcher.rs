//! Module for writing patches into protected code and data
//!
//! Every write is sized before any protection change is made so the memory
//! is only writable for the duration of a single bounded copy.

use crate::{
    error::{PatchError, Result},
    mem::ProtectionScope,
};
use log::debug;
use std::mem::size_of;

/// `jmp rel32`
pub const JMP_REL32: u8 = 0xE9;
/// `call rel32`
pub const CALL_REL32: u8 = 0xE8;
/// `jmp rel8`, replaces short conditional jumps to make them unconditional
pub const JMP_SHORT: u8 = 0xEB;
/// `nop`
pub const NOP: u8 = 0x90;
/// Length of an opcode followed by a rel32 displacement
pub const REDIRECT_LEN: usize = 5;

/// Instruction written by a redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Unconditional jump, control does not return to the patch site
    Jump,
    /// Call, the replacement returns to the instruction after the site
    Call,
}

impl RedirectKind {
    pub fn opcode(self) -> u8 {
        match self {
            RedirectKind::Jump => JMP_REL32,
            RedirectKind::Call => CALL_REL32,
        }
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            JMP_REL32 => Some(RedirectKind::Jump),
            CALL_REL32 => Some(RedirectKind::Call),
            _ => None,
        }
    }
}

/// Content written by a [`PatchRecord`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw bytes copied as is
    Bytes(Vec<u8>),
    /// Pointer sized value, for function pointer tables and operands
    Pointer(usize),
    /// Relative jump or call to `target`
    Redirect { target: usize, kind: RedirectKind },
}

impl Payload {
    /// Number of bytes the payload occupies once written
    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(bytes) => bytes.len(),
            Payload::Pointer(_) => size_of::<usize>(),
            Payload::Redirect { .. } => REDIRECT_LEN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pending write of a payload to an absolute address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub address: usize,
    pub payload: Payload,
}

/// Computes the rel32 displacement of a redirect at `address` reaching
/// `target`, measured from the end of the 5 byte instruction
pub fn displacement(address: usize, target: usize) -> Result<i32> {
    let next = address.wrapping_add(REDIRECT_LEN);

    // The whole address space is reachable when pointers are 32 bits
    if cfg!(target_pointer_width = "32") {
        return Ok(target.wrapping_sub(next) as i32);
    }

    i32::try_from(target as i128 - next as i128)
        .map_err(|_| PatchError::DisplacementOutOfRange { address, target })
}

/// Encodes the redirect instruction written at `address`
pub fn encode_redirect(
    address: usize,
    target: usize,
    kind: RedirectKind,
) -> Result<[u8; REDIRECT_LEN]> {
    let distance = displacement(address, target)?.to_le_bytes();
    Ok([
        kind.opcode(),
        distance[0],
        distance[1],
        distance[2],
        distance[3],
    ])
}

/// Decodes a redirect instruction located at `address` into its kind and
/// absolute target
pub fn decode_redirect(bytes: &[u8], address: usize) -> Option<(RedirectKind, usize)> {
    let (&opcode, rest) = bytes.split_first()?;
    let kind = RedirectKind::from_opcode(opcode)?;
    let distance = i32::from_le_bytes(rest.get(..4)?.try_into().ok()?);

    let target = address
        .wrapping_add(REDIRECT_LEN)
        .wrapping_add_signed(distance as isize);

    Some((kind, target))
}

/// Grants read/write/execute access over the memory at the provided address
/// for the length provided and runs the action on it. Restores the original
/// flags after the action is complete
///
/// ## Safety
///
/// This function acquires the proper write permissions over `addr` for the
/// required `length` but it is unsound if memory past `length` is accessed
///
/// ## Arguments
/// * addr   - The address to unprotect
/// * length - The unprotected region
/// * action - The action to execute on the memory
pub unsafe fn use_memory<F, P>(addr: *const P, length: usize, action: F) -> Result<()>
where
    F: FnOnce(*mut P),
{
    let scope = ProtectionScope::open(addr as usize, length)?;

    // Apply the action on the now mutable memory area
    action(addr.cast_mut());

    scope.restore()
}

/// Copies `bytes` to `address`
///
/// ## Safety
///
/// `address..address + bytes.len()` must be mapped memory that is not
/// executing or being read by other threads during the write
pub unsafe fn write_bytes(address: usize, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }

    use_memory(address as *const u8, bytes.len(), |ptr| {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
    })?;

    debug!("Patched {} bytes @ {:#016x}", bytes.len(), address);
    Ok(())
}

/// Writes a single value to `address` without alignment requirements
///
/// ## Safety
///
/// Same requirements as [`write_bytes`] for `size_of::<T>()` bytes
pub unsafe fn write<T: Copy>(address: usize, value: T) -> Result<()> {
    use_memory(address as *const T, size_of::<T>(), |ptr| {
        ptr.write_unaligned(value);
    })?;

    debug!("Patched {} bytes @ {:#016x}", size_of::<T>(), address);
    Ok(())
}

/// Replaces the pointer stored at `address` with `value`
///
/// ## Safety
///
/// Same requirements as [`write_bytes`] for a pointer sized write
pub unsafe fn write_pointer(address: usize, value: usize) -> Result<()> {
    write(address, value)
}

/// Overwrites `count` bytes at `address` with `byte`
///
/// ## Safety
///
/// Same requirements as [`write_bytes`]
pub unsafe fn fill(address: usize, byte: u8, count: usize) -> Result<()> {
    write_bytes(address, &vec![byte; count])
}

/// Writes a `jmp rel32` or `call rel32` at `address` transferring control
/// to `target`. Memory is left untouched when the target is out of reach
///
/// ## Safety
///
/// Same requirements as [`write_bytes`] for 5 bytes, and `target` must be
/// code compatible with the instruction stream at `address`
pub unsafe fn inject_redirect(address: usize, target: usize, kind: RedirectKind) -> Result<()> {
    let instruction = encode_redirect(address, target, kind)?;
    write_bytes(address, &instruction)?;

    debug!(
        "Redirected {:#016x} to {:#016x} ({:?})",
        address, target, kind
    );
    Ok(())
}

/// Writes the payload of `record`
///
/// ## Safety
///
/// Same requirements as the write function matching the payload
pub unsafe fn apply(record: &PatchRecord) -> Result<()> {
    match &record.payload {
        Payload::Bytes(bytes) => write_bytes(record.address, bytes),
        Payload::Pointer(value) => write_pointer(record.address, *value),
        Payload::Redirect { target, kind } => inject_redirect(record.address, *target, *kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{self, page_size};
    use region::Protection;

    fn code_page() -> region::Allocation {
        region::alloc(page_size(), Protection::READ_EXECUTE).unwrap()
    }

    fn current(address: usize) -> Protection {
        region::query(address as *const u8).unwrap().protection()
    }

    unsafe fn read(address: usize, length: usize) -> Vec<u8> {
        std::slice::from_raw_parts(address as *const u8, length).to_vec()
    }

    #[test]
    fn test_encode_decode_redirect() {
        let address = 0x0040_1000;
        for target in [0x0040_2000, 0x0040_0000, address + REDIRECT_LEN] {
            for kind in [RedirectKind::Jump, RedirectKind::Call] {
                let bytes = encode_redirect(address, target, kind).unwrap();
                assert_eq!(bytes[0], kind.opcode());
                assert_eq!(decode_redirect(&bytes, address), Some((kind, target)));
            }
        }

        let bytes = encode_redirect(0x1000, 0x1005, RedirectKind::Jump).unwrap();
        assert_eq!(bytes, [0xE9, 0, 0, 0, 0]);

        assert_eq!(decode_redirect(&[0x90, 0, 0, 0, 0], 0), None);
        assert_eq!(decode_redirect(&[0xE9, 0, 0], 0), None);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_displacement_limits() {
        let address = 0x1_0000_0000usize;
        let furthest = address + REDIRECT_LEN + i32::MAX as usize;
        assert_eq!(displacement(address, furthest), Ok(i32::MAX));
        assert!(displacement(address, furthest + 1).is_err());

        let nearest = address + REDIRECT_LEN - (i32::MIN as i64).unsigned_abs() as usize;
        assert_eq!(displacement(address, nearest), Ok(i32::MIN));
        assert_eq!(
            displacement(address, nearest - 1),
            Err(PatchError::DisplacementOutOfRange {
                address,
                target: nearest - 1
            })
        );
    }

    #[test]
    fn test_write_bytes_restores_protection() {
        let page = code_page();
        let address = page.as_ptr::<u8>() as usize + 0x20;
        let before = current(address);

        unsafe { write_bytes(address, &[0x56, 0x8B, 0xB4, 0x24]) }.unwrap();

        assert_eq!(unsafe { read(address, 4) }, vec![0x56, 0x8B, 0xB4, 0x24]);
        assert_eq!(current(address), before);
        assert_eq!(mem::holders(address), 0);
    }

    #[test]
    fn test_write_typed_values() {
        let page = code_page();
        let address = page.as_ptr::<u8>() as usize;

        unsafe {
            write::<u8>(address + 3, 0xEB).unwrap();
            write_pointer(address + 9, 0xDEAD_BEEF).unwrap();
            fill(address + 20, NOP, 3).unwrap();
        }

        unsafe {
            assert_eq!(read(address + 3, 1), vec![0xEB]);
            assert_eq!(
                std::ptr::read_unaligned((address + 9) as *const usize),
                0xDEAD_BEEF
            );
            assert_eq!(read(address + 20, 4), vec![NOP, NOP, NOP, 0]);
        }
        assert_eq!(current(address), Protection::READ_EXECUTE);
    }

    #[test]
    fn test_inject_redirect_roundtrip() {
        let page = code_page();
        let base = page.as_ptr::<u8>() as usize;
        let address = base + 0x100;

        for (target, kind) in [
            (base + 0x800, RedirectKind::Jump),
            (base + 0x10, RedirectKind::Call),
        ] {
            unsafe { inject_redirect(address, target, kind) }.unwrap();
            let bytes = unsafe { read(address, REDIRECT_LEN) };
            assert_eq!(decode_redirect(&bytes, address), Some((kind, target)));
        }
        assert_eq!(current(address), Protection::READ_EXECUTE);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_inject_redirect_out_of_range_leaves_memory() {
        let page = code_page();
        let address = page.as_ptr::<u8>() as usize + 0x40;
        let original = unsafe { read(address, REDIRECT_LEN) };

        let target = address.wrapping_add(0x1_0000_0000);
        assert_eq!(
            unsafe { inject_redirect(address, target, RedirectKind::Jump) },
            Err(PatchError::DisplacementOutOfRange { address, target })
        );
        assert_eq!(unsafe { read(address, REDIRECT_LEN) }, original);
    }

    #[test]
    fn test_apply_records() {
        let page = code_page();
        let base = page.as_ptr::<u8>() as usize;

        let records = [
            PatchRecord {
                address: base,
                payload: Payload::Bytes(vec![0x8B, 0xF0, 0x58, 0xEB, 0x16]),
            },
            PatchRecord {
                address: base + 0x10,
                payload: Payload::Pointer(base + 0x200),
            },
            PatchRecord {
                address: base + 0x20,
                payload: Payload::Redirect {
                    target: base + 0x300,
                    kind: RedirectKind::Call,
                },
            },
        ];

        for record in &records {
            unsafe { apply(record) }.unwrap();
        }

        unsafe {
            assert_eq!(read(base, 5), vec![0x8B, 0xF0, 0x58, 0xEB, 0x16]);
            assert_eq!(
                std::ptr::read_unaligned((base + 0x10) as *const usize),
                base + 0x200
            );
            assert_eq!(
                decode_redirect(&read(base + 0x20, 5), base + 0x20),
                Some((RedirectKind::Call, base + 0x300))
            );
        }
        assert_eq!(records[2].payload.len(), REDIRECT_LEN);
    }

    #[test]
    fn test_write_inside_open_scope() {
        let page = code_page();
        let address = page.as_ptr::<u8>() as usize;

        let scope = unsafe { ProtectionScope::open(address, page_size()) }.unwrap();
        unsafe { write::<u8>(address + 1, 0xC3) }.unwrap();

        // The outer scope keeps the page writable
        assert!(mem::is_writable_range(address, 2).unwrap());
        drop(scope);

        assert_eq!(unsafe { read(address + 1, 1) }, vec![0xC3]);
        assert_eq!(current(address), Protection::READ_EXECUTE);
    }

    #[test]
    fn test_empty_write_is_noop() {
        unsafe { write_bytes(0, &[]) }.unwrap();
    }
}
