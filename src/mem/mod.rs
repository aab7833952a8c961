//! Module for scoped memory protection changes
//!
//! Every page made writable by a [`ProtectionScope`] is tracked in a process
//! wide registry holding the number of open scopes covering the page and the
//! protection the page had before the first of them was opened. The page is
//! only restored once the last scope covering it is released, so overlapping
//! scopes may be dropped in any order without leaving a page writable or
//! restoring it while another scope still relies on it.

use crate::error::{PatchError, Result};
use log::error;
use parking_lot::Mutex;
use std::{collections::BTreeMap, ops::Range};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as sys;

#[cfg(not(windows))]
mod portable;
#[cfg(not(windows))]
use self::portable as sys;

/// Native protection flags of the host OS
pub type PageProtection = sys::RawProtection;

/// Protection applied while a scope is open
pub const READ_WRITE_EXECUTE: PageProtection = sys::READ_WRITE_EXECUTE;

/// Page held open by at least one scope
struct PageState {
    /// Number of open scopes covering the page
    holders: usize,
    /// Protection recorded by the first scope to open the page
    original: PageProtection,
}

/// Pages currently held open, keyed by page address
static PAGES: Mutex<BTreeMap<usize, PageState>> = Mutex::new(BTreeMap::new());

/// Size of a memory page on the host
pub fn page_size() -> usize {
    sys::page_size()
}

/// Checks whether the protection flags permit writing
pub fn is_writable(protection: PageProtection) -> bool {
    sys::is_writable(protection)
}

/// Queries the region holding `cursor` on behalf of an operation over
/// `address..address + length`, which is the range reported on failure
fn query(cursor: usize, address: usize, length: usize) -> Result<(usize, PageProtection)> {
    sys::query(cursor).map_err(|code| PatchError::ProtectionChangeFailed {
        address,
        length,
        code,
    })
}

/// Current protection of the page containing `address`
pub fn query_protection(address: usize) -> Result<PageProtection> {
    query(address, address, 1).map(|(_, protection)| protection)
}

/// Splits `address..address + length` into runs of identical protection,
/// clipped to the requested range
pub fn protection_runs(
    address: usize,
    length: usize,
) -> Result<Vec<(Range<usize>, PageProtection)>> {
    let end = address
        .checked_add(length)
        .ok_or(PatchError::ProtectionChangeFailed {
            address,
            length,
            code: 0,
        })?;

    let mut runs: Vec<(Range<usize>, PageProtection)> = Vec::new();
    let mut cursor = address;

    while cursor < end {
        let (region_end, protection) = query(cursor, address, length)?;
        let run_end = region_end.clamp(cursor + 1, end);

        match runs.last_mut() {
            Some((range, last)) if range.end == cursor && *last == protection => {
                range.end = run_end
            }
            _ => runs.push((cursor..run_end, protection)),
        }

        cursor = run_end;
    }

    Ok(runs)
}

/// Checks whether every byte of `address..address + length` is writable
pub fn is_writable_range(address: usize, length: usize) -> Result<bool> {
    Ok(protection_runs(address, length)?
        .iter()
        .all(|(_, protection)| is_writable(*protection)))
}

/// Like [`protection_runs`], except pages held open by a scope report the
/// protection they had before the first scope opened them
pub fn settled_protection_runs(
    address: usize,
    length: usize,
) -> Result<Vec<(Range<usize>, PageProtection)>> {
    let runs = protection_runs(address, length)?;
    let page = page_size();
    let pages = PAGES.lock();

    let mut settled: Vec<(Range<usize>, PageProtection)> = Vec::new();
    for (range, protection) in runs {
        let mut cursor = range.start;
        while cursor < range.end {
            let page_address = cursor & !(page - 1);
            let next = page_address.saturating_add(page).min(range.end);
            let effective = pages
                .get(&page_address)
                .map_or(protection, |state| state.original);

            match settled.last_mut() {
                Some((run, last)) if run.end == cursor && *last == effective => run.end = next,
                _ => settled.push((cursor..next, effective)),
            }

            cursor = next;
        }
    }

    Ok(settled)
}

/// Page aligned range covering `address..address + length`
fn page_span(address: usize, length: usize) -> Result<Range<usize>> {
    let page = page_size();
    let failed = PatchError::ProtectionChangeFailed {
        address,
        length,
        code: 0,
    };

    if length == 0 {
        return Err(failed);
    }

    let start = address & !(page - 1);
    let end = address
        .checked_add(length)
        .and_then(|end| end.checked_add(page - 1))
        .ok_or(failed)?
        & !(page - 1);

    Ok(start..end)
}

/// Restores runs changed by a failed open
unsafe fn rollback(changed: &[(Range<usize>, PageProtection)]) {
    for (range, original) in changed {
        // Already failing, the original error is the one reported
        let _ = sys::protect(range.start, range.end - range.start, *original);
    }
}

/// Scoped read-write-execute access to a range of memory. The previous
/// protection is restored when the scope is dropped or [`restore`]d
///
/// [`restore`]: ProtectionScope::restore
#[must_use = "protection is restored as soon as the scope is dropped"]
pub struct ProtectionScope {
    /// Page aligned range held by this scope
    pages: Range<usize>,
    /// Whether the pages have already been released
    released: bool,
}

impl ProtectionScope {
    /// Makes the pages covering `address..address + length` readable,
    /// writable and executable until the scope ends
    ///
    /// ## Safety
    ///
    /// Changing the protection of memory is not safe, the caller must ensure
    /// no other code depends on the protection of these pages while the
    /// scope is open
    ///
    /// ## Arguments
    /// * address - The address to unprotect
    /// * length  - The length of the unprotected region
    pub unsafe fn open(address: usize, length: usize) -> Result<Self> {
        let span = page_span(address, length)?;
        let page = page_size();

        let mut pages = PAGES.lock();
        let mut changed: Vec<(Range<usize>, PageProtection)> = Vec::new();
        let mut cursor = span.start;

        while cursor < span.end {
            // Already writable through another scope
            if pages.contains_key(&cursor) {
                cursor += page;
                continue;
            }

            let (region_end, original) = match query(cursor, address, length) {
                Ok(value) => value,
                Err(err) => {
                    rollback(&changed);
                    return Err(err);
                }
            };

            // Extend over untracked pages sharing this protection
            let limit = region_end.clamp(cursor + page, span.end);
            let mut run_end = cursor + page;
            while run_end < limit && !pages.contains_key(&run_end) {
                run_end += page;
            }

            if original != READ_WRITE_EXECUTE {
                if let Err(err) = sys::protect(cursor, run_end - cursor, READ_WRITE_EXECUTE) {
                    rollback(&changed);
                    return Err(err);
                }
            }

            changed.push((cursor..run_end, original));
            cursor = run_end;
        }

        // Pages held by other scopes gain a holder
        for page_address in span.clone().step_by(page) {
            if let Some(state) = pages.get_mut(&page_address) {
                state.holders += 1;
            }
        }

        for (range, original) in changed {
            for page_address in range.step_by(page) {
                pages.insert(
                    page_address,
                    PageState {
                        holders: 1,
                        original,
                    },
                );
            }
        }

        Ok(Self {
            pages: span,
            released: false,
        })
    }

    /// Page aligned range covered by the scope
    pub fn pages(&self) -> Range<usize> {
        self.pages.clone()
    }

    /// Ends the scope, reporting any failure to restore the original
    /// protection
    pub fn restore(mut self) -> Result<()> {
        self.released = true;
        unsafe { release(self.pages.clone()) }
    }
}

impl Drop for ProtectionScope {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(err) = unsafe { release(self.pages.clone()) } {
            error!("Failed to restore protection: {}", err);
        }
    }
}

/// Drops one holder from each page of `span`, restoring pages no longer held
unsafe fn release(span: Range<usize>) -> Result<()> {
    let page = page_size();
    let mut pages = PAGES.lock();
    let mut restore: Vec<(Range<usize>, PageProtection)> = Vec::new();

    for page_address in span.step_by(page) {
        let Some(state) = pages.get_mut(&page_address) else {
            continue;
        };

        state.holders -= 1;
        if state.holders > 0 {
            continue;
        }

        let original = state.original;
        pages.remove(&page_address);

        // Coalesce neighbouring pages sharing the same original protection
        match restore.last_mut() {
            Some((range, last)) if range.end == page_address && *last == original => {
                range.end += page
            }
            _ => restore.push((page_address..page_address + page, original)),
        }
    }

    let mut result = Ok(());
    for (range, original) in restore {
        if original == READ_WRITE_EXECUTE {
            continue;
        }

        if let Err(err) = sys::protect(range.start, range.end - range.start, original) {
            result = Err(err);
        }
    }

    result
}

/// Number of scopes currently holding the page containing `address`
pub fn holders(address: usize) -> usize {
    let page = address & !(page_size() - 1);
    PAGES.lock().get(&page).map_or(0, |state| state.holders)
}
