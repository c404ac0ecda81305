use serde::{Deserialize, Serialize};

use crate::scan::StringEncoding;

/// Knobs for the discovery pipeline.
///
/// The strings are console variable names the renderer registers next to the
/// code being looked for; they differ between host builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Referenced next to the `lea` that loads the renderer vtable
    pub primary_string: String,
    /// Tried when the primary string is missing from the image
    pub fallback_string: Option<String>,
    /// Referenced by the function stored right before the render target
    /// manager provider slot
    pub adjacent_string: String,
    pub encoding: StringEncoding,

    /// Instruction that loads the vtable
    pub vtable_lea_pattern: String,
    /// Bytes after the string reference searched for the pattern
    pub scan_window: usize,

    /// Minimum score for a slot to be picked
    pub threshold: usize,
    pub max_slots: usize,
    /// Instruction budget per slot
    pub max_instructions: usize,
    /// Register class the default scorer looks for in rendered instructions
    pub register_class: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            primary_string: "r.StereoEmulationHeight".to_string(),
            fallback_string: Some("r.StereoEmulationFOV".to_string()),
            adjacent_string: "vr.PixelDensity".to_string(),
            encoding: StringEncoding::Utf16,
            vtable_lea_pattern: "48 8D 05 ? ? ? ?".to_string(),
            scan_window: 100,
            threshold: 10,
            max_slots: 30,
            max_instructions: 1000,
            register_class: "xmm".to_string(),
        }
    }
}

impl DiscoveryConfig {
    /// Strings tried when locating the vtable, in order
    pub fn vtable_strings(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_string.as_str()).chain(self.fallback_string.as_deref())
    }
}
