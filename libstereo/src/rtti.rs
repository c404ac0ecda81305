//! MSVC RTTI walking on live objects.
//!
//! The layouts below are overlays of what the compiler emitted into the host
//! image. They are only ever read by value through [`memory::read`]; nothing
//! here constructs or owns a host object. On x64 every cross reference inside
//! the metadata is an RVA against the image that holds the locator.

use crate::ffi::address::Address;
use crate::ffi::POINTER_SIZE;
use crate::memory;
use crate::pe::{ModuleBounds, ModuleRegistry};

/// x64 locators carry signature 1, x86 ones 0
const COL_SIGNATURE_X64: u32 = 1;

/// Offset of the decorated name inside `TypeDescriptor`
const TYPE_NAME_OFFSET: usize = 16;

const MAX_TYPE_NAME_LEN: usize = 512;

/// Upper bound on base classes walked per hierarchy
const MAX_BASE_CLASSES: u32 = 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CompleteObjectLocator {
    pub signature: u32,
    pub offset: u32,
    pub cd_offset: u32,
    pub type_descriptor: u32,
    pub class_descriptor: u32,
    pub self_rva: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClassHierarchyDescriptor {
    pub signature: u32,
    pub attributes: u32,
    pub num_base_classes: u32,
    pub base_class_array: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BaseClassDescriptor {
    pub type_descriptor: u32,
    pub num_contained_bases: u32,
    pub pmd: [i32; 3],
    pub attributes: u32,
    pub class_descriptor: u32,
}

/// Fixed part of `std::type_info`; the decorated name follows inline
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TypeDescriptorHeader {
    pub vftable: usize,
    pub spare: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Decorated name, e.g. `.?AVRenderer@@`
    pub raw_name: String,
    /// Readable name, e.g. `Renderer`
    pub name: String,
}

impl TypeInfo {
    fn from_raw(raw_name: String) -> Self {
        let name = demangle(&raw_name);
        Self { raw_name, name }
    }

    pub fn matches(&self, type_name: &str) -> bool {
        self.name == type_name || self.raw_name == type_name
    }
}

/// Turns `.?AVInner@Outer@@` into `Outer::Inner`.
///
/// Anything that is not a plain class or struct descriptor is returned as is.
pub fn demangle(raw_name: &str) -> String {
    let Some(body) = raw_name
        .strip_prefix(".?AV")
        .or_else(|| raw_name.strip_prefix(".?AU"))
    else {
        return raw_name.to_string();
    };

    let body = body.strip_suffix("@@").unwrap_or(body);

    if body.contains('?') || body.contains('$') {
        return raw_name.to_string();
    }

    body.split('@')
        .filter(|part| !part.is_empty())
        .rev()
        .collect::<Vec<_>>()
        .join("::")
}

fn read_c_string(address: Address) -> Option<String> {
    let span = memory::readable_span(address, MAX_TYPE_NAME_LEN);
    let bytes = memory::read_bytes(address, span)?;

    let end = bytes.iter().position(|&b| b == 0)?;
    String::from_utf8(bytes[..end].to_vec()).ok()
}

fn read_type_descriptor(module: &ModuleBounds, rva: u32) -> Option<TypeInfo> {
    let descriptor = module.va(rva);

    // Header must be readable even though only the name is used
    memory::read::<TypeDescriptorHeader>(descriptor)?;

    read_c_string(descriptor + TYPE_NAME_OFFSET).map(TypeInfo::from_raw)
}

/// Locator for `object` and the module whose base its RVAs are relative to
pub fn complete_object_locator(
    registry: &ModuleRegistry,
    object: Address,
) -> Option<(CompleteObjectLocator, &ModuleBounds)> {
    if object.is_null() {
        return None;
    }

    let vtable = Address::new(memory::read::<usize>(object)?);
    let locator = Address::new(memory::read::<usize>(vtable.checked_sub(POINTER_SIZE)?)?);

    let Some(module) = registry.module_within(locator) else {
        log::debug!("Locator {locator} for object {object} is outside known modules");
        return None;
    };

    let col = memory::read::<CompleteObjectLocator>(locator)?;

    if col.signature != COL_SIGNATURE_X64 {
        log::debug!("Locator {locator} has signature {}", col.signature);
        return None;
    }

    Some((col, module))
}

/// Most-derived type of `object`
pub fn get_type_info(registry: &ModuleRegistry, object: Address) -> Option<TypeInfo> {
    let (col, module) = complete_object_locator(registry, object)?;

    read_type_descriptor(module, col.type_descriptor)
}

/// Every class in the hierarchy of `object`, the object's own type first
pub fn base_classes(registry: &ModuleRegistry, object: Address) -> Option<Vec<TypeInfo>> {
    let (col, module) = complete_object_locator(registry, object)?;

    let hierarchy = memory::read::<ClassHierarchyDescriptor>(module.va(col.class_descriptor))?;

    if hierarchy.num_base_classes > MAX_BASE_CLASSES {
        log::debug!("Implausible base class count {}", hierarchy.num_base_classes);
        return None;
    }

    let array = module.va(hierarchy.base_class_array);
    let mut classes = Vec::with_capacity(hierarchy.num_base_classes as usize);

    for index in 0..hierarchy.num_base_classes as usize {
        let descriptor_rva = memory::read::<u32>(array + index * 4)?;
        let descriptor = memory::read::<BaseClassDescriptor>(module.va(descriptor_rva))?;

        classes.push(read_type_descriptor(module, descriptor.type_descriptor)?);
    }

    Some(classes)
}

/// True if `type_name` (readable or decorated) appears in the hierarchy of
/// `object`. Any unreadable or unrecognised metadata answers false.
pub fn derives_from(registry: &ModuleRegistry, object: Address, type_name: &str) -> bool {
    base_classes(registry, object)
        .is_some_and(|classes| classes.iter().any(|class| class.matches(type_name)))
}
