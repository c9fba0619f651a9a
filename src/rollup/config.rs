// Re-export the rollup config types from the central config module.
// The types live in crate::config to keep YAML deserialization in one place.
pub use crate::config::{CtaRouting, DiscoveryConfig, EngineConfig, ScanConfig};
