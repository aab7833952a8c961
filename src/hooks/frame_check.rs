use crate::{
    error::Result,
    patcher::{self, JMP_SHORT},
    pattern::{Pattern, ScanMode, SearchRange},
};

/// Frame pacing wait loop condition:
///
/// ```text
/// test edx, edx
/// jle ...
/// push edx
/// call edi
/// ```
pub const FRAME_CHECK_PATTERN: Pattern = Pattern {
    name: "FrameCheck",
    signature: "85 D2 7E ? 52 FF D7",
    mode: ScanMode::ExactlyOne,
};

/// Offset of the `jle` opcode
const FRAME_CHECK_BRANCH_OFFSET: isize = 2;

/// Always jumps out of the wait condition
///
/// ## Safety
///
/// `range` must cover mapped code of the game module which is not being
/// executed while it is patched
pub unsafe fn hook_frame_check(range: SearchRange<'_>) -> Result<()> {
    let site = FRAME_CHECK_PATTERN.locate_one(range)?;

    // jle -> jmp
    patcher::write::<u8>(site.at(FRAME_CHECK_BRANCH_OFFSET), JMP_SHORT)
}
