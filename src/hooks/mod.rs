use crate::{config::PatchConfig, error::Result, pattern::SearchRange};
use log::{debug, warn};

pub mod frame_check;
pub mod intro_splash;

/// Outcome counts of a patch pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    /// Patch sites written
    pub applied: usize,
    /// Patch sites disabled by the config
    pub skipped: usize,
    /// Patch sites that could not be applied
    pub failed: usize,
}

impl PassReport {
    /// Runs `hook` when `enabled` is explicitly on, recording the outcome.
    /// Failures disable that one feature, the pass carries on
    fn record<F>(&mut self, name: &str, enabled: Option<bool>, hook: F)
    where
        F: FnOnce() -> Result<()>,
    {
        if enabled != Some(true) {
            debug!("Skipping {} patch (disabled)", name);
            self.skipped += 1;
            return;
        }

        match hook() {
            Ok(()) => {
                debug!("Applied {} patch", name);
                self.applied += 1;
            }
            Err(err) => {
                warn!("Failed to apply {} patch: {}", name, err);
                self.failed += 1;
            }
        }
    }
}

/// Applies all hooks enabled by `config` in order
///
/// ## Safety
///
/// `range` must cover mapped code of the game module which is not being
/// executed while it is patched
pub unsafe fn apply_hooks(range: SearchRange<'_>, config: &PatchConfig) -> PassReport {
    let mut report = PassReport::default();

    report.record("SkipIntroSplashes", config.skip_intro_splashes, || {
        intro_splash::hook_intro_splash(range)
    });
    report.record("SkipFrameCheck", config.skip_frame_check, || {
        frame_check::hook_frame_check(range)
    });

    report
}
