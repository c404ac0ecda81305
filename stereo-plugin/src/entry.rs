use std::path::Path;

use anyhow::Context;
use libstereo::ModuleRegistry;
use libstereo::hook::NativeHookInstaller;
use libstereo::stereo::{StereoDiscovery, StereoHooks};
use parking_lot::Mutex;

use crate::config::{CONFIG_FILE, PluginConfig};
use crate::detours;
use crate::logger::{GlobalLogger, LoggerError};

/// Installed hooks live for the rest of the process; the lock also keeps
/// two starts from running discovery at once
static HOOKS: Mutex<Option<StereoHooks>> = Mutex::new(None);

/// Loads the config, brings up logging, discovers the stereo interface and
/// installs the hooks.
///
/// On any discovery failure the host is left exactly as it was and the
/// failure is returned for the caller to report. Calling again after a
/// failure re-runs the whole pipeline.
pub fn start() -> anyhow::Result<()> {
    start_from(CONFIG_FILE)
}

fn start_from(config_path: impl AsRef<Path>) -> anyhow::Result<()> {
    let config_path = config_path.as_ref();
    let mut installed = HOOKS.lock();

    if installed.is_some() {
        log::warn!("Stereo hooks already installed, ignoring repeated start");
        return Ok(());
    }

    let (config, config_error) = PluginConfig::load_or_default(config_path);

    if config.log.console {
        os::alloc_console();
    }

    match GlobalLogger::init(&config.log) {
        Ok(()) | Err(LoggerError::AlreadyInitialized) => {}
        Err(err) => return Err(err.into()),
    }

    if let Some(err) = config_error {
        log::warn!("Using default config, {} was rejected: {err}", config_path.display());
    }

    log::info!("Starting stereo hook discovery");

    let registry = ModuleRegistry::snapshot().context("Failed to enumerate loaded modules")?;
    log::debug!("{} modules loaded", registry.len());

    let table = detours::table()?;

    let outcome = StereoDiscovery::new(&registry, &config.discovery).run_with(
        &NativeHookInstaller::new(),
        &table,
        detours::bind,
    );

    match outcome {
        Ok(hooks) => {
            *installed = Some(hooks);
            Ok(())
        }
        Err(failure) => {
            detours::unbind();
            Err(failure.into())
        }
    }
}

#[cfg(windows)]
mod os {
    use windows::Win32::System::Console::AllocConsole;

    pub fn alloc_console() {
        // Fails harmlessly when the host already has a console
        if let Err(err) = unsafe { AllocConsole() } {
            eprintln!("AllocConsole failed: {err}");
        }
    }
}

#[cfg(not(windows))]
mod os {
    pub fn alloc_console() {}
}


#[cfg(windows)]
mod dll {
    use std::ffi::c_void;

    use windows::{
        Win32::{
            Foundation::HINSTANCE,
            System::SystemServices::{
                DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH, DLL_THREAD_ATTACH, DLL_THREAD_DETACH,
            },
        },
        core::BOOL,
    };

    #[unsafe(no_mangle)]
    #[allow(non_snake_case)]
    pub extern "system" fn DllMain(hmodule: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
        let result = match reason {
            DLL_PROCESS_ATTACH => {
                // Discovery reads and patches code; not under the loader lock
                let spawned = std::thread::Builder::new()
                    .name("stereo-discovery".to_string())
                    .spawn(|| {
                        if let Err(err) = super::start() {
                            log::error!("Stereo hooks not installed: {err:#}");
                        }
                    });

                spawned.is_ok()
            }
            DLL_PROCESS_DETACH => {
                log::info!("Process detach (module: {:p})", hmodule.0);
                true
            }
            DLL_THREAD_ATTACH | DLL_THREAD_DETACH => true,
            _ => {
                log::warn!("Unknown DLL reason code {:#x}", reason);
                true
            }
        };

        result.into()
    }
}
