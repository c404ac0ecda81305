//! Stereo rendering hook discovery.
//!
//! Finds the renderer vtable from string evidence, picks the view-offset
//! slot by instruction heuristics and installs the three hooks stereo
//! rendering needs. See [`discovery::StereoDiscovery`].

pub mod classify;
pub mod config;
pub mod discovery;

pub use classify::{FunctionScorer, SimdRegisterScorer, SlotClassifier};
pub use config::DiscoveryConfig;
pub use discovery::{
    DiscoveryError, DiscoveryFailure, DiscoveryOutcome, DiscoveryStage, StereoDetours,
    StereoDiscovery, StereoHooks,
};
