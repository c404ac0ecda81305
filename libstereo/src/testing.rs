//! In-memory PE image used by the introspection tests.
//!
//! Layout (RVAs):
//! - headers at 0, `.text` at 0x1000, `.rdata` at 0x2000
//! - 0x1000 locator: references the primary and fallback strings, each
//!   followed by `lea rax, [vtable]`
//! - 0x1100 filler, 0x1140 SIMD-heavy, 0x1180 projection, 0x1200 adjacent
//!   (references the secondary string), 0x1280 provider, 0x12C0/0x1300 a
//!   function split into a primary part and a chained fragment
//! - 0x2000 exception directory, 0x2100 unwind info
//! - 0x2200 RTTI for `StereoRenderer : RendererBase`
//! - 0x2800 vtable, 0x2A00 object, 0x2B00 zeroed data
//! - 0x3000.. strings

use std::sync::Arc;

use parking_lot::Mutex;

use crate::ffi::address::Address;
use crate::hook::{HookError, HookInstaller, HookResult, InstalledHook};
use crate::pe::{ModuleBounds, ModuleRegistry};

pub const IMAGE_SIZE: usize = 0x6000;
pub const PE_OFFSET: usize = 0x80;

const COFF_OFFSET: usize = PE_OFFSET + 4;
const OPTIONAL_OFFSET: usize = COFF_OFFSET + 20;
const OPTIONAL_SIZE: usize = 0xF0;
const EXCEPTION_DIRECTORY_OFFSET: usize = OPTIONAL_OFFSET + 0x88;
const SECTION_TABLE_OFFSET: usize = OPTIONAL_OFFSET + OPTIONAL_SIZE;
const SECTION_HEADER_SIZE: usize = 40;

pub const FUNC_LOCATOR_RVA: u32 = 0x1000;
pub const FUNC_A_RVA: u32 = FUNC_LOCATOR_RVA;
pub const CODE_GAP_RVA: u32 = 0x1050;
pub const FUNC_FILLER_RVA: u32 = 0x1100;
pub const FUNC_SIMD_RVA: u32 = 0x1140;
pub const FUNC_PROJECTION_RVA: u32 = 0x1180;
pub const FUNC_ADJACENT_RVA: u32 = 0x1200;
pub const FUNC_PROVIDER_RVA: u32 = 0x1280;
pub const FUNC_PRIMARY_RVA: u32 = 0x12C0;
pub const FUNC_FRAGMENT_RVA: u32 = 0x1300;

/// rel32 fields of the string references
pub const PRIMARY_REF_RVA: u32 = 0x1003;
pub const FALLBACK_REF_RVA: u32 = 0x101A;
pub const SECONDARY_REF_RVA: u32 = 0x1203;

/// movaps count in the SIMD function
pub const SIMD_INSTRUCTIONS: usize = 12;

const EXCEPTION_RVA: u32 = 0x2000;
pub const EXCEPTION_COUNT: usize = 8;
const UNWIND_SIMPLE_RVA: u32 = 0x2100;
const UNWIND_PRIMARY_RVA: u32 = 0x2110;
const UNWIND_CHAINED_RVA: u32 = 0x2120;

const COL_RVA: u32 = 0x2200;
const TYPE_DERIVED_RVA: u32 = 0x2300;
const TYPE_BASE_RVA: u32 = 0x2340;
const HIERARCHY_RVA: u32 = 0x2400;
const BASE_ARRAY_RVA: u32 = 0x2420;
const BASE_DERIVED_RVA: u32 = 0x2440;
const BASE_BASE_RVA: u32 = 0x2460;

pub const VTABLE_RVA: u32 = 0x2800;
pub const VTABLE_LEN: usize = 9;
pub const SIMD_SLOT: usize = 5;
pub const PROJECTION_SLOT: usize = 6;
pub const ADJACENT_SLOT: usize = 7;
pub const PROVIDER_SLOT: usize = 8;

pub const OBJECT_RVA: u32 = 0x2A00;
pub const STATIC_DATA_RVA: u32 = 0x2B00;

pub const PRIMARY_STRING: &str = "r.StereoEmulationHeight";
pub const PRIMARY_STRING_RVA: u32 = 0x3000;
pub const FALLBACK_STRING: &str = "r.StereoEmulationFOV";
pub const FALLBACK_STRING_RVA: u32 = 0x3100;
pub const SECONDARY_STRING: &str = "vr.PixelDensity";
pub const SECONDARY_STRING_RVA: u32 = 0x3200;
pub const ASCII_STRING: &str = "StereoAscii";
pub const ASCII_STRING_RVA: u32 = 0x3300;

pub const DERIVED_TYPE: &str = "StereoRenderer";
pub const BASE_TYPE: &str = "RendererBase";

/// Mapped-layout PE image living on the heap
pub struct SyntheticImage {
    // u64 backing keeps the base and every pointer slot 8-byte aligned
    words: Vec<u64>,
}

impl SyntheticImage {
    pub fn build() -> Self {
        let mut image = Self {
            words: vec![0; IMAGE_SIZE / 8],
        };

        image.write_headers();
        image.write_code();
        image.write_exception_directory();
        image.write_rtti();
        image.write_vtable();
        image.write_strings();

        image
    }

    pub fn base(&self) -> Address {
        Address::from_ptr(self.words.as_ptr())
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, IMAGE_SIZE) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, IMAGE_SIZE) }
    }

    pub fn module(&self) -> ModuleBounds {
        ModuleBounds::from_base(self.base()).unwrap()
    }

    pub fn registry(&self) -> ModuleRegistry {
        ModuleRegistry::from_modules(vec![self.module()])
    }

    pub fn va(&self, rva: u32) -> Address {
        self.base() + rva as usize
    }

    /// Slot 0 of the vtable
    pub fn vtable(&self) -> Address {
        self.va(VTABLE_RVA)
    }

    /// Object whose vtable pointer refers to [`Self::vtable`]
    pub fn object(&self) -> Address {
        self.va(OBJECT_RVA)
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.write_bytes(offset, &[value]);
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    fn write_va(&mut self, offset: usize, rva: u32) {
        let va = self.va(rva).as_u64();
        self.write_u64(offset, va);
    }

    pub fn clear_exception_directory(&mut self) {
        self.write_u64(EXCEPTION_DIRECTORY_OFFSET, 0);
    }

    /// Points the vtable slot at another function
    pub fn set_slot(&mut self, slot: usize, rva: u32) {
        let offset = VTABLE_RVA as usize + slot * 8;

        if rva == 0 {
            self.write_u64(offset, 0);
        } else {
            self.write_va(offset, rva);
        }
    }

    fn write_headers(&mut self) {
        self.write_bytes(0, b"MZ");
        self.write_u32(0x3C, PE_OFFSET as u32);
        self.write_bytes(PE_OFFSET, b"PE\0\0");

        // COFF
        self.write_u16(COFF_OFFSET, 0x8664);
        self.write_u16(COFF_OFFSET + 2, 2);
        self.write_u16(COFF_OFFSET + 16, OPTIONAL_SIZE as u16);
        self.write_u16(COFF_OFFSET + 18, 0x22);

        // PE32+ optional header
        let opt = OPTIONAL_OFFSET;
        self.write_u16(opt, 0x20B);
        self.write_u32(opt + 0x04, 0x1000);
        self.write_u32(opt + 0x08, 0x4000);
        self.write_u32(opt + 0x10, FUNC_LOCATOR_RVA);
        self.write_u32(opt + 0x14, 0x1000);
        self.write_u64(opt + 0x18, 0x1_4000_0000);
        self.write_u32(opt + 0x20, 0x1000);
        self.write_u32(opt + 0x24, 0x1000);
        self.write_u16(opt + 0x28, 6);
        self.write_u16(opt + 0x30, 6);
        self.write_u32(opt + 0x38, IMAGE_SIZE as u32);
        self.write_u32(opt + 0x3C, 0x400);
        self.write_u16(opt + 0x44, 2);
        self.write_u32(opt + 0x6C, 16);

        self.write_u32(EXCEPTION_DIRECTORY_OFFSET, EXCEPTION_RVA);
        self.write_u32(
            EXCEPTION_DIRECTORY_OFFSET + 4,
            (EXCEPTION_COUNT * 12) as u32,
        );

        self.write_section(0, b".text\0\0\0", 0x1000, 0x1000, 0x6000_0020);
        self.write_section(1, b".rdata\0\0", 0x2000, 0x4000, 0x4000_0040);
    }

    fn write_section(&mut self, index: usize, name: &[u8; 8], rva: u32, size: u32, flags: u32) {
        let header = SECTION_TABLE_OFFSET + index * SECTION_HEADER_SIZE;

        self.write_bytes(header, name);
        self.write_u32(header + 8, size);
        self.write_u32(header + 12, rva);
        self.write_u32(header + 16, size);
        self.write_u32(header + 20, rva);
        self.write_u32(header + 36, flags);
    }

    /// `opcode rel32` with the rel32 resolved against the instruction end
    fn write_rip_relative(&mut self, rva: u32, opcode: &[u8], target: u32) {
        let end = rva + opcode.len() as u32 + 4;
        let rel = target as i64 - end as i64;

        self.write_bytes(rva as usize, opcode);
        self.write_u32(rva as usize + opcode.len(), rel as i32 as u32);
    }

    fn write_code(&mut self) {
        let text = self.bytes_mut();
        text[0x1000..0x2000].fill(0xCC);

        // lea rdx, [primary]; nops; lea rax, [vtable]
        self.write_rip_relative(FUNC_LOCATOR_RVA, &[0x48, 0x8D, 0x15], PRIMARY_STRING_RVA);
        self.write_bytes(0x1007, &[0x90; 9]);
        self.write_rip_relative(0x1010, &[0x48, 0x8D, 0x05], VTABLE_RVA);

        // lea rcx, [fallback]; nops; lea rax, [vtable]; ret
        self.write_rip_relative(0x1017, &[0x48, 0x8D, 0x0D], FALLBACK_STRING_RVA);
        self.write_bytes(0x101E, &[0x90; 10]);
        self.write_rip_relative(0x1028, &[0x48, 0x8D, 0x05], VTABLE_RVA);
        self.write_u8(0x102F, 0xC3);

        // xor eax, eax; ret
        for rva in [FUNC_FILLER_RVA, FUNC_PROJECTION_RVA, FUNC_PROVIDER_RVA, FUNC_PRIMARY_RVA, FUNC_FRAGMENT_RVA] {
            self.write_bytes(rva as usize, &[0x31, 0xC0, 0xC3]);
        }

        // movaps xmm0, xmm1 x12; ret
        let simd: Vec<u8> = [0x0F, 0x28, 0xC1].repeat(SIMD_INSTRUCTIONS);
        self.write_bytes(FUNC_SIMD_RVA as usize, &simd);
        self.write_u8(FUNC_SIMD_RVA as usize + simd.len(), 0xC3);

        // lea rcx, [secondary]; ret
        self.write_rip_relative(FUNC_ADJACENT_RVA, &[0x48, 0x8D, 0x0D], SECONDARY_STRING_RVA);
        self.write_u8(FUNC_ADJACENT_RVA as usize + 7, 0xC3);
    }

    fn write_exception_directory(&mut self) {
        let entries = [
            (FUNC_LOCATOR_RVA, 0x1040, UNWIND_SIMPLE_RVA),
            (FUNC_FILLER_RVA, 0x1110, UNWIND_SIMPLE_RVA),
            (FUNC_SIMD_RVA, 0x1180, UNWIND_SIMPLE_RVA),
            (FUNC_PROJECTION_RVA, 0x1190, UNWIND_SIMPLE_RVA),
            (FUNC_ADJACENT_RVA, 0x1240, UNWIND_SIMPLE_RVA),
            (FUNC_PROVIDER_RVA, 0x1290, UNWIND_SIMPLE_RVA),
            (FUNC_PRIMARY_RVA, 0x1300, UNWIND_PRIMARY_RVA),
            (FUNC_FRAGMENT_RVA, 0x1340, UNWIND_CHAINED_RVA),
        ];

        for (index, (begin, end, unwind)) in entries.into_iter().enumerate() {
            let offset = EXCEPTION_RVA as usize + index * 12;
            self.write_u32(offset, begin);
            self.write_u32(offset + 4, end);
            self.write_u32(offset + 8, unwind);
        }

        // Version 1, no flags, no codes
        self.write_u8(UNWIND_SIMPLE_RVA as usize, 0x01);
        self.write_u8(UNWIND_PRIMARY_RVA as usize, 0x01);

        // Version 1 with UNW_FLAG_CHAININFO, parent entry right after the header
        let chained = UNWIND_CHAINED_RVA as usize;
        self.write_u8(chained, 0x21);
        self.write_u32(chained + 4, FUNC_PRIMARY_RVA);
        self.write_u32(chained + 8, FUNC_FRAGMENT_RVA);
        self.write_u32(chained + 12, UNWIND_PRIMARY_RVA);
    }

    fn write_rtti(&mut self) {
        let col = COL_RVA as usize;
        self.write_u32(col, 1);
        self.write_u32(col + 12, TYPE_DERIVED_RVA);
        self.write_u32(col + 16, HIERARCHY_RVA);
        self.write_u32(col + 20, COL_RVA);

        self.write_bytes(TYPE_DERIVED_RVA as usize + 16, b".?AVStereoRenderer@@\0");
        self.write_bytes(TYPE_BASE_RVA as usize + 16, b".?AVRendererBase@@\0");

        let hierarchy = HIERARCHY_RVA as usize;
        self.write_u32(hierarchy + 8, 2);
        self.write_u32(hierarchy + 12, BASE_ARRAY_RVA);

        self.write_u32(BASE_ARRAY_RVA as usize, BASE_DERIVED_RVA);
        self.write_u32(BASE_ARRAY_RVA as usize + 4, BASE_BASE_RVA);

        self.write_u32(BASE_DERIVED_RVA as usize, TYPE_DERIVED_RVA);
        self.write_u32(BASE_DERIVED_RVA as usize + 4, 1);
        self.write_u32(BASE_BASE_RVA as usize, TYPE_BASE_RVA);
    }

    fn write_vtable(&mut self) {
        // Locator pointer in front of slot 0
        self.write_va(VTABLE_RVA as usize - 8, COL_RVA);

        for slot in 0..SIMD_SLOT {
            self.set_slot(slot, FUNC_FILLER_RVA);
        }
        self.set_slot(SIMD_SLOT, FUNC_SIMD_RVA);
        self.set_slot(PROJECTION_SLOT, FUNC_PROJECTION_RVA);
        self.set_slot(ADJACENT_SLOT, FUNC_ADJACENT_RVA);
        self.set_slot(PROVIDER_SLOT, FUNC_PROVIDER_RVA);
        self.set_slot(VTABLE_LEN, 0);

        self.write_va(OBJECT_RVA as usize, VTABLE_RVA);
    }

    fn write_strings(&mut self) {
        for (rva, text) in [
            (PRIMARY_STRING_RVA, PRIMARY_STRING),
            (FALLBACK_STRING_RVA, FALLBACK_STRING),
            (SECONDARY_STRING_RVA, SECONDARY_STRING),
        ] {
            let utf16: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
            self.write_bytes(rva as usize, &utf16);
        }

        self.write_bytes(ASCII_STRING_RVA as usize, ASCII_STRING.as_bytes());
    }
}

/// Sets raw data size and file pointer of section `index` in raw image bytes
pub fn set_section_raw(bytes: &mut [u8], index: usize, pointer: u32, size: u32) {
    let header = SECTION_TABLE_OFFSET + index * SECTION_HEADER_SIZE;
    bytes[header + 16..header + 20].copy_from_slice(&size.to_le_bytes());
    bytes[header + 20..header + 24].copy_from_slice(&pointer.to_le_bytes());
}

pub fn set_section_virtual_size(bytes: &mut [u8], index: usize, virtual_size: u32) {
    let header = SECTION_TABLE_OFFSET + index * SECTION_HEADER_SIZE;
    bytes[header + 8..header + 12].copy_from_slice(&virtual_size.to_le_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Inline,
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    pub kind: HookKind,
    pub name: String,
    pub target: Address,
    pub replacement: Address,
}

#[derive(Debug, Default)]
struct Journal {
    installed: Vec<InstallRecord>,
    active: Vec<String>,
    enables: usize,
}

/// Installer that records requests instead of patching code
#[derive(Debug, Default, Clone)]
pub struct RecordingInstaller {
    journal: Arc<Mutex<Journal>>,
    fail_at: Option<usize>,
    fail_enable_at: Option<usize>,
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creating hook number `index` (0-based) fails
    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::default()
        }
    }

    /// Enabling hook number `index` (0-based) fails
    pub fn failing_enable_at(index: usize) -> Self {
        Self {
            fail_enable_at: Some(index),
            ..Self::default()
        }
    }

    pub fn installed(&self) -> Vec<InstallRecord> {
        self.journal.lock().installed.clone()
    }

    /// Names of enabled handles that have not been dropped or uninstalled yet
    pub fn active(&self) -> Vec<String> {
        self.journal.lock().active.clone()
    }

    fn record(
        &self,
        kind: HookKind,
        name: &str,
        target: Address,
        replacement: Address,
    ) -> HookResult<Box<dyn InstalledHook>> {
        let mut journal = self.journal.lock();

        if self.fail_at == Some(journal.installed.len()) {
            return Err(HookError::NullPointer("recording installer told to fail"));
        }

        journal.installed.push(InstallRecord {
            kind,
            name: name.to_string(),
            target,
            replacement,
        });

        Ok(Box::new(RecordedHook {
            name: name.to_string(),
            target,
            fail_enable: self.fail_enable_at,
            journal: self.journal.clone(),
        }))
    }
}

impl HookInstaller for RecordingInstaller {
    fn create_inline(
        &self,
        name: &str,
        target: Address,
        replacement: Address,
    ) -> HookResult<Box<dyn InstalledHook>> {
        self.record(HookKind::Inline, name, target, replacement)
    }

    fn create_pointer(
        &self,
        name: &str,
        slot: Address,
        replacement: Address,
    ) -> HookResult<Box<dyn InstalledHook>> {
        self.record(HookKind::Pointer, name, slot, replacement)
    }
}

#[derive(Debug)]
struct RecordedHook {
    name: String,
    target: Address,
    fail_enable: Option<usize>,
    journal: Arc<Mutex<Journal>>,
}

impl RecordedHook {
    fn deactivate(&self) -> bool {
        let mut journal = self.journal.lock();
        let before = journal.active.len();
        journal.active.retain(|name| name != &self.name);
        journal.active.len() != before
    }
}

impl InstalledHook for RecordedHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> Address {
        self.target
    }

    fn original(&self) -> Address {
        self.target
    }

    fn is_enabled(&self) -> bool {
        self.journal.lock().active.contains(&self.name)
    }

    fn enable(&self) -> HookResult<()> {
        let mut journal = self.journal.lock();

        if journal.active.contains(&self.name) {
            return Err(HookError::AlreadyEnabled);
        }

        let index = journal.enables;
        journal.enables += 1;

        if self.fail_enable == Some(index) {
            return Err(HookError::NullPointer("recording installer told to fail enable"));
        }

        journal.active.push(self.name.clone());

        Ok(())
    }

    fn uninstall(&self) -> HookResult<()> {
        if self.deactivate() {
            Ok(())
        } else {
            Err(HookError::NotEnabled)
        }
    }
}

impl Drop for RecordedHook {
    fn drop(&mut self) {
        self.deactivate();
    }
}
