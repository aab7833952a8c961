//! Signature compilation and scanning of loaded module memory

use crate::error::{PatchError, Result};
use log::debug;
use std::{fmt, marker::PhantomData, str::FromStr};

/// Single token of a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteMask {
    /// Literal byte which must be present at this position
    Byte(u8),
    /// Matches any byte
    Any,
}

impl ByteMask {
    /// Checks whether the provided memory byte satisfies this token
    #[inline]
    pub fn matches(&self, byte: u8) -> bool {
        match self {
            ByteMask::Byte(value) => *value == byte,
            ByteMask::Any => true,
        }
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, ByteMask::Any)
    }
}

/// Compiled byte signature, a non-empty sequence of [`ByteMask`] tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    tokens: Box<[ByteMask]>,
}

impl Signature {
    /// Compiles a textual signature such as `"48 8B ?? ?? 00"`.
    ///
    /// Tokens are separated by whitespace, each one is either two hex
    /// digits or a wildcard (`?` or `??`)
    ///
    /// ## Arguments
    /// * text - The signature text
    pub fn compile(text: &str) -> Result<Self> {
        let tokens = text
            .split_whitespace()
            .map(parse_token)
            .collect::<Result<Vec<_>>>()?;

        if tokens.is_empty() {
            return Err(PatchError::MalformedSignature {
                token: text.to_string(),
                reason: "signature is empty",
            });
        }

        Ok(Self {
            tokens: tokens.into_boxed_slice(),
        })
    }

    /// Creates a signature from an opcode listing and a mask string where
    /// `x` marks a byte that must match and `?` marks a wildcard
    ///
    /// ## Arguments
    /// * op_codes - The op codes to match against
    /// * mask     - The mask deciding which op codes are used
    pub fn from_code_mask(op_codes: &[u8], mask: &str) -> Result<Self> {
        if mask.is_empty() {
            return Err(PatchError::MalformedSignature {
                token: String::new(),
                reason: "signature is empty",
            });
        }

        if mask.chars().count() != op_codes.len() {
            return Err(PatchError::MalformedSignature {
                token: mask.to_string(),
                reason: "mask length does not match the op code count",
            });
        }

        let tokens = mask
            .chars()
            .zip(op_codes.iter().copied())
            .map(|(mask, op)| match mask {
                'x' => Ok(ByteMask::Byte(op)),
                '?' => Ok(ByteMask::Any),
                other => Err(PatchError::MalformedSignature {
                    token: other.to_string(),
                    reason: "mask characters must be 'x' or '?'",
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tokens: tokens.into_boxed_slice(),
        })
    }

    pub fn tokens(&self) -> &[ByteMask] {
        &self.tokens
    }

    /// Number of bytes covered by the signature
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Always false, compiled signatures are never empty
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Compares the start of `window` against the signature, skipping
    /// wildcard positions
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() >= self.tokens.len()
            && self
                .tokens
                .iter()
                .zip(window)
                .all(|(token, byte)| token.matches(*byte))
    }

    /// Iterates the offsets of every window in `bytes` matching the
    /// signature, in ascending order. Overlapping matches are all reported
    pub fn scan<'a>(&'a self, bytes: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
        bytes
            .windows(self.tokens.len())
            .enumerate()
            .filter(move |(_, window)| self.matches(window))
            .map(|(offset, _)| offset)
    }
}

fn parse_token(token: &str) -> Result<ByteMask> {
    if token == "?" || token == "??" {
        return Ok(ByteMask::Any);
    }

    if token.len() != 2 || !token.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(PatchError::MalformedSignature {
            token: token.to_string(),
            reason: "expected two hex digits or a wildcard",
        });
    }

    u8::from_str_radix(token, 16)
        .map(ByteMask::Byte)
        .map_err(|_| PatchError::MalformedSignature {
            token: token.to_string(),
            reason: "expected two hex digits or a wildcard",
        })
}

impl FromStr for Signature {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::compile(s)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, token) in self.tokens.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            match token {
                ByteMask::Byte(value) => write!(f, "{:02X}", value)?,
                ByteMask::Any => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

/// Region of mapped memory to scan
#[derive(Debug, Clone, Copy)]
pub struct SearchRange<'a> {
    base: usize,
    len: usize,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> SearchRange<'a> {
    /// Creates a range over raw process memory
    ///
    /// ## Safety
    ///
    /// The whole of `base..base + len` must be mapped and readable for
    /// the lifetime of the range
    pub unsafe fn from_raw(base: usize, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(PatchError::EmptyRange);
        }

        Ok(Self {
            base,
            len,
            _marker: PhantomData,
        })
    }

    /// Creates a range over a borrowed byte buffer
    pub fn from_slice(bytes: &'a [u8]) -> Result<Self> {
        // Safety: The slice keeps the memory alive and readable for 'a
        unsafe { Self::from_raw(bytes.as_ptr() as usize, bytes.len()) }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false, ranges are never empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bytes(&self) -> &'a [u8] {
        // Safety: Readability for 'a is guaranteed by the constructors
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.len) }
    }
}

/// How many matches a search expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// The lowest addressed match
    First,
    /// Exactly one match must exist
    ExactlyOne,
    /// Exactly the provided number of matches must exist
    Count(usize),
    /// Every match, possibly none
    All,
}

/// Address where a signature matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MatchHandle {
    address: usize,
}

impl MatchHandle {
    pub fn new(address: usize) -> Self {
        Self { address }
    }

    /// Start address of the matched bytes
    pub fn address(&self) -> usize {
        self.address
    }

    /// Absolute address `offset` bytes from the start of the match. The
    /// offset is not bounds checked
    #[inline]
    pub fn at(&self, offset: isize) -> usize {
        self.address.wrapping_add_signed(offset)
    }

    /// Reads a value `offset` bytes from the start of the match
    ///
    /// ## Safety
    ///
    /// The memory at the offset must be mapped and readable for the size
    /// of `T`
    pub unsafe fn read<T: Copy>(&self, offset: isize) -> T {
        std::ptr::read_unaligned(self.at(offset) as *const T)
    }

    /// Resolves the rel32 operand at `operand` into the absolute address it
    /// targets, relative to the end of the instruction at `instruction_end`
    ///
    /// ## Safety
    ///
    /// The four operand bytes must be mapped and readable
    pub unsafe fn relative_target(&self, operand: isize, instruction_end: isize) -> usize {
        let displacement: i32 = self.read(operand);
        self.at(instruction_end).wrapping_add_signed(displacement as isize)
    }
}

/// Matches produced by [`find`] in ascending address order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult {
    matches: Vec<MatchHandle>,
}

impl MatchResult {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn first(&self) -> Option<MatchHandle> {
        self.matches.first().copied()
    }

    pub fn get(&self, index: usize) -> Option<MatchHandle> {
        self.matches.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = MatchHandle> + '_ {
        self.matches.iter().copied()
    }

    pub fn addresses(&self) -> Vec<usize> {
        self.matches.iter().map(MatchHandle::address).collect()
    }
}

impl IntoIterator for MatchResult {
    type Item = MatchHandle;
    type IntoIter = std::vec::IntoIter<MatchHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.matches.into_iter()
    }
}

/// Searches `range` for `signature`, enforcing the match count demanded by
/// `mode`
///
/// ## Arguments
/// * signature - The compiled signature to look for
/// * range     - The memory to search
/// * mode      - The number of matches expected
pub fn find(signature: &Signature, range: SearchRange<'_>, mode: ScanMode) -> Result<MatchResult> {
    let base = range.base();
    let mut offsets = signature.scan(range.bytes());

    let offsets: Vec<usize> = match mode {
        // Nothing past the first match can change the outcome
        ScanMode::First => offsets.next().into_iter().collect(),
        _ => offsets.collect(),
    };

    let matches: Vec<MatchHandle> = offsets
        .into_iter()
        .map(|offset| MatchHandle::new(base + offset))
        .collect();

    match mode {
        ScanMode::First | ScanMode::ExactlyOne if matches.is_empty() => Err(PatchError::NoMatch {
            signature: signature.to_string(),
        }),
        ScanMode::ExactlyOne if matches.len() > 1 => Err(PatchError::AmbiguousMatch {
            signature: signature.to_string(),
            count: matches.len(),
        }),
        ScanMode::Count(expected) if matches.len() != expected => {
            Err(PatchError::WrongMatchCount {
                signature: signature.to_string(),
                expected,
                found: matches.len(),
            })
        }
        _ => Ok(MatchResult { matches }),
    }
}

/// Compiles `text`, requires a unique match within `range` and returns the
/// address `offset` bytes from it
pub fn find_pattern(text: &str, range: SearchRange<'_>, offset: isize) -> Result<usize> {
    let signature = Signature::compile(text)?;
    let found = find(&signature, range, ScanMode::ExactlyOne)?;
    let handle = found.first().ok_or(PatchError::NoMatch {
        signature: signature.to_string(),
    })?;

    debug!("Found {} @ {:#016x}", signature, handle.address());

    Ok(handle.at(offset))
}

/// Named signature known to a patch site
pub struct Pattern {
    /// The name of the pattern
    pub name: &'static str,
    /// The signature text
    pub signature: &'static str,
    /// The number of matches expected
    pub mode: ScanMode,
}

impl Pattern {
    /// Compiles and searches for the pattern within `range`, logging the
    /// located addresses
    pub fn locate(&self, range: SearchRange<'_>) -> Result<MatchResult> {
        let signature = Signature::compile(self.signature)?;
        let found = find(&signature, range, self.mode)?;

        for handle in found.iter() {
            debug!("Found {} @ {:#016x}", self.name, handle.address());
        }

        Ok(found)
    }

    /// Locates the first match of the pattern, for patterns which are
    /// expected to be unique
    pub fn locate_one(&self, range: SearchRange<'_>) -> Result<MatchHandle> {
        self.locate(range)?
            .first()
            .ok_or_else(|| PatchError::NoMatch {
                signature: self.signature.to_string(),
            })
    }
}
