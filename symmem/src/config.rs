use crate::error::MemoryError;
use crate::{DEFAULT_ADDRESS_BITS, DEFAULT_PAGE_LIMIT, DEFAULT_PAGE_SIZE};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// How a load or store treats an address that is still symbolic after the
/// unconstrained-access heuristic had its chance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressPolicy {
    /// Resolve against every mapped page consistent with the path.
    #[default]
    Symbolic,
    /// Pin the address to a single model value with a new path constraint.
    Concretize,
    /// Keep the address symbolic, but confine it to `page_limit` consecutive
    /// pages once its range spans more than that.
    LimitPages,
}

/// Memory model configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Bytes per page (hex string like "0x1000"), must be a power of two
    #[serde(with = "hex_string")]
    pub page_size: u64,

    /// Width of addresses in bits
    pub address_bits: u32,

    /// Map a fresh region for accesses through fully unconstrained addresses
    pub heuristic_unconstrained_access: bool,

    /// Resolution of symbolic addresses
    pub address_policy: AddressPolicy,

    /// Width in pages of the window the `limit_pages` policy allows
    pub page_limit: u64,

    /// Prefer a constant base found inside the address when concretizing
    pub use_heuristic_base: bool,

    /// Only fork an errored state for an ambiguous load when that state is satisfiable
    pub prune_infeasible_errored: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            address_bits: DEFAULT_ADDRESS_BITS,
            heuristic_unconstrained_access: true,
            address_policy: AddressPolicy::default(),
            page_limit: DEFAULT_PAGE_LIMIT,
            use_heuristic_base: true,
            prune_infeasible_errored: false,
        }
    }
}

impl MemoryConfig {
    pub fn with_address_bits(mut self, address_bits: u32) -> Self {
        self.address_bits = address_bits;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_heuristic_unconstrained_access(mut self, enabled: bool) -> Self {
        self.heuristic_unconstrained_access = enabled;
        self
    }

    pub fn with_address_policy(mut self, policy: AddressPolicy) -> Self {
        self.address_policy = policy;
        self
    }

    pub fn with_page_limit(mut self, page_limit: u64) -> Self {
        self.page_limit = page_limit;
        self
    }

    pub fn with_heuristic_base(mut self, enabled: bool) -> Self {
        self.use_heuristic_base = enabled;
        self
    }

    /// log2 of the page size.
    pub fn offset_bits(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.page_size < 2 || !self.page_size.is_power_of_two() {
            return Err(MemoryError::InvalidConfig(format!(
                "page size must be a power of two of at least 2: {:#x}",
                self.page_size
            )));
        }
        if self.address_bits > 64 || self.address_bits <= self.offset_bits() {
            return Err(MemoryError::InvalidConfig(format!(
                "address width {} must exceed the {} page offset bits and fit in 64",
                self.address_bits,
                self.offset_bits()
            )));
        }
        if self.page_limit == 0 {
            return Err(MemoryError::InvalidConfig(
                "page limit must be at least one page".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", path.as_ref(), e))?;

        let config: MemoryConfig = toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config file {:?}: {}", path.as_ref(), e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Invalid config file {:?}: {}", path.as_ref(), e))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(&path, contents)
            .map_err(|e| anyhow!("Failed to write config file {:?}: {}", path.as_ref(), e))?;

        Ok(())
    }
}

/// Parse a hex string that may have 0x prefix and underscores for readability
fn parse_hex(s: &str) -> Result<u64> {
    let cleaned = s.replace('_', "");

    if let Some(hex_str) = cleaned.strip_prefix("0x") {
        u64::from_str_radix(hex_str, 16).map_err(|e| anyhow!("Invalid hex string '{}': {}", s, e))
    } else {
        u64::from_str_radix(&cleaned, 16).map_err(|e| anyhow!("Invalid hex string '{}': {}", s, e))
    }
}

/// Custom deserializer for hex strings
mod hex_string {
    use super::parse_hex;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_str: String = String::deserialize(deserializer)?;
        parse_hex(&hex_str).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format!("0x{:x}", value).serialize(serializer)
    }
}
