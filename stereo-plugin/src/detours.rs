//! Replacement functions installed over the host's stereo rendering
//! interface.
//!
//! They sit on the render thread's hot path: no allocation, no locking, only
//! an atomic load to reach the original. Originals are bound before any hook
//! is enabled; while unbound the detours return neutral values.

use std::ffi::c_void;

use libstereo::ffi::fnptr::{FnPtr, FnPtrResult};
use libstereo::stereo::{StereoDetours, StereoHooks};

pub type CalculateStereoViewOffsetFn = unsafe extern "C" fn(
    this: *mut c_void,
    pass: i32,
    rotation: *mut c_void,
    world_to_meters: f32,
    location: *mut c_void,
);

/// The matrix is returned through a hidden out pointer
pub type GetStereoProjectionMatrixFn =
    unsafe extern "C" fn(this: *mut c_void, out: *mut c_void, pass: i32) -> *mut c_void;

pub type GetRenderTargetManagerFn = unsafe extern "C" fn(this: *mut c_void) -> *mut c_void;

static VIEW_OFFSET: FnPtr<CalculateStereoViewOffsetFn> = FnPtr::null();
static PROJECTION: FnPtr<GetStereoProjectionMatrixFn> = FnPtr::null();
static RENDER_TARGET_PROVIDER: FnPtr<GetRenderTargetManagerFn> = FnPtr::null();

/// Serializes tests that touch the bound originals
#[cfg(test)]
pub(crate) static TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// Addresses handed to the hook installer
pub fn table() -> FnPtrResult<StereoDetours> {
    Ok(StereoDetours {
        view_offset: FnPtr::<CalculateStereoViewOffsetFn>::address_of(calculate_stereo_view_offset)?,
        projection: FnPtr::<GetStereoProjectionMatrixFn>::address_of(get_stereo_projection_matrix)?,
        render_target_provider: FnPtr::<GetRenderTargetManagerFn>::address_of(
            get_render_target_manager,
        )?,
    })
}

/// Makes the detours forward to the functions the hooks replace.
///
/// Must run before the hooks are enabled.
pub fn bind(hooks: &StereoHooks) -> FnPtrResult<()> {
    VIEW_OFFSET.set(hooks.view_offset.original())?;
    PROJECTION.set(hooks.projection.original())?;
    RENDER_TARGET_PROVIDER.set(hooks.render_target_provider.original())?;

    log::debug!(
        "Originals bound: view offset {}, projection {}, provider {}",
        VIEW_OFFSET.address(),
        PROJECTION.address(),
        RENDER_TARGET_PROVIDER.address()
    );

    Ok(())
}

/// Drops originals of hooks that did not survive installation
pub fn unbind() {
    VIEW_OFFSET.clear();
    PROJECTION.clear();
    RENDER_TARGET_PROVIDER.clear();
}

unsafe extern "C" fn calculate_stereo_view_offset(
    this: *mut c_void,
    pass: i32,
    rotation: *mut c_void,
    world_to_meters: f32,
    location: *mut c_void,
) {
    // Safety: bound from the hook that replaced a function of this signature
    if let Ok(original) = unsafe { VIEW_OFFSET.as_fn() } {
        unsafe { original(this, pass, rotation, world_to_meters, location) }
    }
}

unsafe extern "C" fn get_stereo_projection_matrix(
    this: *mut c_void,
    out: *mut c_void,
    pass: i32,
) -> *mut c_void {
    match unsafe { PROJECTION.as_fn() } {
        Ok(original) => unsafe { original(this, out, pass) },
        Err(_) => out,
    }
}

unsafe extern "C" fn get_render_target_manager(this: *mut c_void) -> *mut c_void {
    match unsafe { RENDER_TARGET_PROVIDER.as_fn() } {
        Ok(original) => unsafe { original(this) },
        Err(_) => std::ptr::null_mut(),
    }
}
