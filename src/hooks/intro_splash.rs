use crate::{
    error::Result,
    patcher::{self, JMP_SHORT},
    pattern::{Pattern, ScanMode, SearchRange},
};

/// Start of the logo sequence check:
///
/// ```text
/// mov ecx, dword ptr ss:[ebp+8C]
/// test ecx, ecx
/// je ...
/// ```
pub const SHOW_LOGO_SEQUENCE_PATTERN: Pattern = Pattern {
    name: "ShowLogoSequence",
    signature: "8B 8D 8C 00 00 00 85 C9",
    mode: ScanMode::ExactlyOne,
};

/// Offset of the `je` guarding the splash screens
const LOGO_BRANCH_OFFSET: isize = 8;

/// Turns the branch into an unconditional jump so the game goes straight to
/// the title screen
///
/// ## Safety
///
/// `range` must cover mapped code of the game module which is not being
/// executed while it is patched
pub unsafe fn hook_intro_splash(range: SearchRange<'_>) -> Result<()> {
    let site = SHOW_LOGO_SEQUENCE_PATTERN.locate_one(range)?;

    // je -> jmp
    patcher::write::<u8>(site.at(LOGO_BRANCH_OFFSET), JMP_SHORT)
}
