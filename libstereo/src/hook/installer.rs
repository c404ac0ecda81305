use super::errors::HookResult;
use super::inline::InlineHook;
use super::pointer::PointerHook;
use super::traits::{HookInstaller, InstalledHook};
use crate::ffi::address::Address;

/// Installer that patches the live process
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeHookInstaller;

impl NativeHookInstaller {
    pub fn new() -> Self {
        Self
    }
}

impl HookInstaller for NativeHookInstaller {
    fn create_inline(
        &self,
        name: &str,
        target: Address,
        replacement: Address,
    ) -> HookResult<Box<dyn InstalledHook>> {
        let hook = InlineHook::new(name, target, replacement)?;

        log::info!("Inline hook '{name}' prepared at {target}, original at {}", hook.original());

        Ok(Box::new(hook))
    }

    fn create_pointer(
        &self,
        name: &str,
        slot: Address,
        replacement: Address,
    ) -> HookResult<Box<dyn InstalledHook>> {
        let hook = PointerHook::new(name, slot, replacement)?;

        log::info!("Pointer hook '{name}' prepared at {slot}");

        Ok(Box::new(hook))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::memory;

    #[test]
    fn test_install_pointer_and_drop_restores() {
        let slot = Box::new(AtomicUsize::new(0x1111));
        let address = Address::from_ptr(&*slot);

        let hook = NativeHookInstaller::new()
            .install_pointer("slot", address, Address::new(0x2222))
            .unwrap();

        assert!(hook.is_enabled());
        assert_eq!(hook.target(), address);
        assert_eq!(hook.original(), Address::new(0x1111));
        assert_eq!(memory::read::<usize>(address), Some(0x2222));

        drop(hook);
        assert_eq!(memory::read::<usize>(address), Some(0x1111));
    }

    #[test]
    fn test_create_pointer_leaves_slot_untouched() {
        let slot = Box::new(AtomicUsize::new(0x1111));
        let address = Address::from_ptr(&*slot);

        let hook = NativeHookInstaller::new()
            .create_pointer("slot", address, Address::new(0x2222))
            .unwrap();

        assert!(!hook.is_enabled());
        assert_eq!(hook.original(), Address::new(0x1111));
        assert_eq!(memory::read::<usize>(address), Some(0x1111));

        hook.enable().unwrap();
        assert_eq!(memory::read::<usize>(address), Some(0x2222));

        drop(hook);
        assert_eq!(memory::read::<usize>(address), Some(0x1111));
    }

    #[test]
    fn test_install_inline_rejects_null() {
        let result = NativeHookInstaller::new().install_inline("null", Address::NULL, Address::new(1));
        assert!(result.is_err());
    }
}
