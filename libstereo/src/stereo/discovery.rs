use std::{convert::Infallible, error::Error as StdError, fmt};

use thiserror::Error;

use super::classify::SlotClassifier;
use super::config::DiscoveryConfig;
use crate::ffi::POINTER_SIZE;
use crate::ffi::address::Address;
use crate::hook::{HookError, HookInstaller, InstalledHook};
use crate::pattern::{Pattern, PatternError};
use crate::pe::{ModuleBounds, ModuleRegistry};
use crate::scan::{self, Disassembler};
use crate::{func, memory};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Registry has no main module")]
    NoMainModule,

    #[error("Invalid vtable pattern")]
    InvalidPattern(#[from] PatternError),

    #[error("Vtable pattern is empty")]
    EmptyPattern,

    #[error("No code reference to any of {0:?}")]
    VtableNotFound(Vec<String>),

    #[error("No code reference to {0:?}")]
    StringNotReferenced(String),

    #[error("No slot of vtable {0} scored high enough")]
    NoQualifyingSlot(Address),

    #[error("Slot {index} of vtable {vtable} is unreadable or null")]
    UnreadableSlot { vtable: Address, index: usize },

    #[error("No function contains {0}")]
    NoContainingFunction(Address),

    #[error("No stored pointer to {0} or any function before it")]
    NoStoredPointer(Address),

    #[error("Failed to install {name}")]
    Hook {
        name: &'static str,
        #[source]
        source: HookError,
    },

    #[error("Failed to bind hook originals")]
    Bind(#[source] Box<dyn StdError + Send + Sync>),
}

pub type DiscoveryResult<T> = std::result::Result<T, DiscoveryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStage {
    LocateVtable,
    ClassifySlot,
    LocateAdjacentFunction,
    Install,
}

impl fmt::Display for DiscoveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiscoveryStage::LocateVtable => "locate vtable",
            DiscoveryStage::ClassifySlot => "classify slot",
            DiscoveryStage::LocateAdjacentFunction => "locate adjacent function",
            DiscoveryStage::Install => "install",
        };

        f.write_str(name)
    }
}

/// Pipeline error tagged with the stage that produced it
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed")]
pub struct DiscoveryFailure {
    pub stage: DiscoveryStage,
    #[source]
    pub error: DiscoveryError,
}

impl DiscoveryFailure {
    fn at(stage: DiscoveryStage) -> impl FnOnce(DiscoveryError) -> Self {
        move |error| Self { stage, error }
    }
}

pub type DiscoveryOutcome = Result<StereoHooks, DiscoveryFailure>;

/// Replacement functions for the three hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StereoDetours {
    pub view_offset: Address,
    pub projection: Address,
    pub render_target_provider: Address,
}

/// Live hooks; dropping this value uninstalls all of them
#[derive(Debug)]
pub struct StereoHooks {
    pub vtable: Address,
    pub slot: usize,
    pub view_offset: Box<dyn InstalledHook>,
    pub projection: Box<dyn InstalledHook>,
    pub render_target_provider: Box<dyn InstalledHook>,
}

impl StereoHooks {
    pub fn handles(&self) -> [&dyn InstalledHook; 3] {
        [
            self.view_offset.as_ref(),
            self.projection.as_ref(),
            self.render_target_provider.as_ref(),
        ]
    }
}

pub const VIEW_OFFSET_HOOK: &str = "CalculateStereoViewOffset";
pub const PROJECTION_HOOK: &str = "GetStereoProjectionMatrix";
pub const RENDER_TARGET_PROVIDER_HOOK: &str = "GetRenderTargetManager";

/// Discovery over the main module of `registry`.
///
/// Every stage is a function of the image and the config only; a failed run
/// can simply be repeated with a different config.
pub struct StereoDiscovery<'a> {
    registry: &'a ModuleRegistry,
    config: &'a DiscoveryConfig,
    disasm: Disassembler,
}

impl<'a> StereoDiscovery<'a> {
    pub fn new(registry: &'a ModuleRegistry, config: &'a DiscoveryConfig) -> Self {
        Self {
            registry,
            config,
            disasm: Disassembler::new(),
        }
    }

    fn module(&self) -> DiscoveryResult<&'a ModuleBounds> {
        let registry: &'a ModuleRegistry = self.registry;
        registry.main_module().ok_or(DiscoveryError::NoMainModule)
    }

    /// Vtable loaded by the `lea` that follows a reference to the primary
    /// (or fallback) string
    pub fn locate_vtable(&mut self) -> DiscoveryResult<Address> {
        let config = self.config;
        let module = self.module()?;

        let pattern = Pattern::new(&config.vtable_lea_pattern)?;
        if pattern.is_empty() {
            return Err(DiscoveryError::EmptyPattern);
        }

        for text in config.vtable_strings() {
            let Some(reference) = self.disasm.find_string_reference(module, text, config.encoding)
            else {
                log::warn!("String {text:?} is not referenced, trying next");
                continue;
            };

            let Some(lea) = pattern.find(reference, config.scan_window) else {
                log::warn!(
                    "No {pattern} within {} bytes of the reference at {reference}",
                    config.scan_window
                );
                continue;
            };

            let Some(vtable) = self.disasm.resolve_displacement(lea) else {
                log::warn!("Instruction at {lea} does not resolve to an address");
                continue;
            };

            log::info!("Vtable {vtable} located through {text:?} (lea at {lea})");

            return Ok(vtable);
        }

        Err(DiscoveryError::VtableNotFound(
            config.vtable_strings().map(str::to_string).collect(),
        ))
    }

    /// Slot of `vtable` holding the view-offset function
    pub fn classify_slot(&mut self, vtable: Address) -> DiscoveryResult<usize> {
        let classifier = SlotClassifier::from_config(self.config);

        let slot = classifier
            .classify(&mut self.disasm, vtable)
            .ok_or(DiscoveryError::NoQualifyingSlot(vtable))?;

        log::info!("View offset function is slot {slot} of {vtable}");

        Ok(slot)
    }

    /// Slot that stores the render target manager provider.
    ///
    /// The function referencing the adjacent string is stored somewhere in
    /// the module; the provider lives in the next pointer-sized slot.
    pub fn locate_adjacent_function(&mut self) -> DiscoveryResult<Address> {
        let config = self.config;
        let module = self.module()?;
        let text = config.adjacent_string.as_str();

        let reference = self
            .disasm
            .find_string_reference(module, text, config.encoding)
            .ok_or_else(|| DiscoveryError::StringNotReferenced(text.to_string()))?;

        let start = func::find_function_start(self.registry, reference)
            .ok_or(DiscoveryError::NoContainingFunction(reference))?;

        let stored = match scan::scan_ptr(module, start) {
            Some(stored) => stored,
            None => {
                log::debug!("Function {start} is not stored anywhere, walking back");

                func::find_virtual_function_start(self.registry, start)
                    .and_then(|function| scan::scan_ptr(module, function))
                    .ok_or(DiscoveryError::NoStoredPointer(start))?
            }
        };

        let slot = stored + POINTER_SIZE;

        log::info!("Render target manager provider slot at {slot} (after {stored})");

        Ok(slot)
    }

    /// Installs all three hooks or none.
    ///
    /// The hooks are created first and handed to `bind` while nothing is
    /// patched yet, so detours can reach the originals from their first call.
    /// Any failure drops the handles, which uninstalls the enabled ones.
    pub fn install<F, E>(
        &self,
        installer: &dyn HookInstaller,
        vtable: Address,
        slot: usize,
        provider_slot: Address,
        detours: &StereoDetours,
        bind: F,
    ) -> DiscoveryResult<StereoHooks>
    where
        F: FnOnce(&StereoHooks) -> Result<(), E>,
        E: StdError + Send + Sync + 'static,
    {
        let hook_error = |name| move |source| DiscoveryError::Hook { name, source };

        let view_offset_target = slot_function(vtable, slot)?;
        let projection_target = slot_function(vtable, slot + 1)?;

        let view_offset = installer
            .create_inline(VIEW_OFFSET_HOOK, view_offset_target, detours.view_offset)
            .map_err(hook_error(VIEW_OFFSET_HOOK))?;

        let projection = installer
            .create_inline(PROJECTION_HOOK, projection_target, detours.projection)
            .map_err(hook_error(PROJECTION_HOOK))?;

        let render_target_provider = installer
            .create_pointer(
                RENDER_TARGET_PROVIDER_HOOK,
                provider_slot,
                detours.render_target_provider,
            )
            .map_err(hook_error(RENDER_TARGET_PROVIDER_HOOK))?;

        let hooks = StereoHooks {
            vtable,
            slot,
            view_offset,
            projection,
            render_target_provider,
        };

        bind(&hooks).map_err(|err| DiscoveryError::Bind(Box::new(err)))?;

        for (name, hook) in [
            (VIEW_OFFSET_HOOK, &hooks.view_offset),
            (PROJECTION_HOOK, &hooks.projection),
            (RENDER_TARGET_PROVIDER_HOOK, &hooks.render_target_provider),
        ] {
            hook.enable().map_err(hook_error(name))?;
        }

        Ok(hooks)
    }

    /// Whole pipeline: locate, classify, locate adjacent, install
    pub fn run(&mut self, installer: &dyn HookInstaller, detours: &StereoDetours) -> DiscoveryOutcome {
        self.run_with(installer, detours, |_| Ok::<(), Infallible>(()))
    }

    /// [`Self::run`] with a hook that sees the created hooks before any of
    /// them is enabled
    pub fn run_with<F, E>(
        &mut self,
        installer: &dyn HookInstaller,
        detours: &StereoDetours,
        bind: F,
    ) -> DiscoveryOutcome
    where
        F: FnOnce(&StereoHooks) -> Result<(), E>,
        E: StdError + Send + Sync + 'static,
    {
        let vtable = self
            .locate_vtable()
            .map_err(DiscoveryFailure::at(DiscoveryStage::LocateVtable))?;

        let slot = self
            .classify_slot(vtable)
            .map_err(DiscoveryFailure::at(DiscoveryStage::ClassifySlot))?;

        let provider_slot = self
            .locate_adjacent_function()
            .map_err(DiscoveryFailure::at(DiscoveryStage::LocateAdjacentFunction))?;

        let hooks = self
            .install(installer, vtable, slot, provider_slot, detours, bind)
            .map_err(DiscoveryFailure::at(DiscoveryStage::Install))?;

        log::info!(
            "Stereo hooks installed: vtable {vtable}, slot {slot}, provider slot {provider_slot}"
        );

        Ok(hooks)
    }
}

fn slot_function(vtable: Address, index: usize) -> DiscoveryResult<Address> {
    memory::read::<usize>(vtable + index * POINTER_SIZE)
        .filter(|&function| function != 0)
        .map(Address::new)
        .ok_or(DiscoveryError::UnreadableSlot { vtable, index })
}
