//! Engine configuration.
//!
//! Configuration is read once at process start by the factory that assembles
//! the engine; no processor reads the environment mid-call.

use meterbill_core::Resolution;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the `RocksDB` data directory (default: "/data/meterbill").
    pub data_dir: String,

    /// Resolution used when a usage job doesn't specify one.
    pub default_resolution: Resolution,

    /// Currency assumed for invoices whose job and subscription both omit it
    /// (one-off invoices).
    pub default_currency: String,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let default_resolution = match std::env::var("METERBILL_DEFAULT_RESOLUTION")
            .unwrap_or_default()
            .as_str()
        {
            "hourly" => Resolution::Hourly,
            "daily" => Resolution::Daily,
            _ => Resolution::Monthly,
        };

        Self {
            data_dir: std::env::var("METERBILL_DATA_DIR")
                .unwrap_or_else(|_| "/data/meterbill".into()),
            default_resolution,
            default_currency: std::env::var("METERBILL_DEFAULT_CURRENCY")
                .unwrap_or_else(|_| "usd".into()),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data/meterbill".into(),
            default_resolution: Resolution::Monthly,
            default_currency: "usd".into(),
        }
    }
}
