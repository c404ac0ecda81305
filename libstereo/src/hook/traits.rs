use std::fmt::Debug;

use super::errors::HookResult;
use crate::ffi::address::Address;

/// Handle to one redirection in the process.
///
/// A handle may be created disabled, so its original is known before any
/// code is patched. Dropping the handle uninstalls it; `uninstall` exists for
/// callers that want to see the error.
pub trait InstalledHook: Send + Sync + Debug {
    /// Get a descriptive name for this hook (for debugging/logging)
    fn name(&self) -> &str;

    /// Patched location: function entry for inline hooks, slot for pointer hooks
    fn target(&self) -> Address;

    /// Address to call to reach the original behaviour
    fn original(&self) -> Address;

    fn is_enabled(&self) -> bool;

    /// Make the redirection live
    fn enable(&self) -> HookResult<()>;

    /// Restore original behavior
    fn uninstall(&self) -> HookResult<()>;
}

/// Capability to redirect control flow, kept behind a trait so discovery can
/// be exercised without patching code
pub trait HookInstaller {
    /// Prepare a redirect of the function at `target` to `replacement`;
    /// nothing is patched until the handle is enabled
    fn create_inline(
        &self,
        name: &str,
        target: Address,
        replacement: Address,
    ) -> HookResult<Box<dyn InstalledHook>>;

    /// Prepare an overwrite of the pointer stored at `slot`
    fn create_pointer(
        &self,
        name: &str,
        slot: Address,
        replacement: Address,
    ) -> HookResult<Box<dyn InstalledHook>>;

    /// Redirect the function at `target` to `replacement`
    fn install_inline(
        &self,
        name: &str,
        target: Address,
        replacement: Address,
    ) -> HookResult<Box<dyn InstalledHook>> {
        let hook = self.create_inline(name, target, replacement)?;
        hook.enable()?;

        Ok(hook)
    }

    /// Overwrite the pointer stored at `slot` with `replacement`
    fn install_pointer(
        &self,
        name: &str,
        slot: Address,
        replacement: Address,
    ) -> HookResult<Box<dyn InstalledHook>> {
        let hook = self.create_pointer(name, slot, replacement)?;
        hook.enable()?;

        Ok(hook)
    }
}
