#![allow(clippy::missing_safety_doc)]

use config::{load_or_create_config, PatchConfig};
use constants::{APP_VERSION, CODE_SECTION};
use error::Result;
use hooks::PassReport;
use init::InitLatch;
use log::{debug, error, info, LevelFilter};
use section::SectionUnprotector;

pub mod config;
pub mod constants;
pub mod error;
pub mod hooks;
pub mod init;
pub mod mem;
pub mod patcher;
pub mod pattern;
pub mod section;

/// Latch ensuring the patch pass only ever runs once
static INIT: InitLatch = InitLatch::new();

/// Unprotects the code section of the module at `module_base` and applies
/// every hook enabled by `config`
///
/// ## Safety
///
/// `module_base` must be the base of a module mapped into this process and
/// none of its code may be executing on other threads during the pass
pub unsafe fn run_patch_pass(module_base: usize, config: &PatchConfig) -> Result<PassReport> {
    let guard = SectionUnprotector::open_for_module(module_base, Some(CODE_SECTION))?;

    let report = hooks::apply_hooks(guard.search_range()?, config);

    guard.restore()?;

    info!(
        "Patch pass complete: {} applied, {} skipped, {} failed",
        report.applied, report.skipped, report.failed
    );

    Ok(report)
}

/// Initializes logging and runs the patch pass over the module at
/// `module_base`. Only the first call does anything, concurrent callers
/// return once that call has finished. Returns whether this call ran the
/// pass
///
/// ## Safety
///
/// Same requirements as [`run_patch_pass`]
pub unsafe fn initialize_module(module_base: usize) -> bool {
    INIT.run(|| {
        // The filter admits every level, the configured one is applied
        // through the max level once the config has been read
        let installed = env_logger::builder()
            .filter_level(LevelFilter::Trace)
            .filter_module("goblin", LevelFilter::Warn)
            .try_init()
            .is_ok();

        // A logger installed by the host keeps its own level
        if installed {
            log::set_max_level(LevelFilter::Debug);
        }

        let config = load_or_create_config();

        if installed {
            log::set_max_level(config.level_filter());
        }

        debug!("Starting mgr-patch-plugin v{}", APP_VERSION);

        if let Err(err) = run_patch_pass(module_base, &config) {
            error!("Patch pass aborted: {}", err);
        }
    })
}

/// Runs the patch pass over the game executable
#[cfg(windows)]
pub fn initialize() -> bool {
    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;

    let module = unsafe { GetModuleHandleW(std::ptr::null()) } as usize;
    if module == 0 {
        return false;
    }

    unsafe { initialize_module(module) }
}

/// Entry point called by the ASI loader once the game has been loaded
#[cfg(windows)]
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn InitializeASI() {
    initialize();
}

#[cfg(windows)]
#[no_mangle]
#[allow(non_snake_case, unused_variables)]
unsafe extern "system" fn DllMain(dll_module: usize, call_reason: u32, _: *mut ()) -> bool {
    use windows_sys::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    match call_reason {
        DLL_PROCESS_ATTACH => {
            #[cfg(debug_assertions)]
            {
                use windows_sys::Win32::System::Console::AllocConsole;
                AllocConsole();
            }
        }
        DLL_PROCESS_DETACH => {
            #[cfg(debug_assertions)]
            {
                use windows_sys::Win32::System::Console::FreeConsole;
                FreeConsole();
            }
        }
        _ => {}
    }

    true
}
