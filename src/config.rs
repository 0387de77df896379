//! TOML configuration selecting the block size and value encoding of a leaf.
//!
//! ```toml
//! block_size = 4096
//!
//! [value]
//! kind = "variable"
//! max_len = 200
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::btree::{max_entry_cost, AnySizer, FixedSizer, VarSizer, MAX_KEY_SIZE};
use crate::storage::btree::leaf::HEADER_LEN;
use crate::types::{BlockSize, LeafError, Result};

/// Value encoding stored in each pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueConfig {
    /// Every value is exactly `len` bytes.
    Fixed {
        /// Value width in bytes.
        len: usize,
    },
    /// Values carry a varint length prefix and at most `max_len` payload bytes.
    Variable {
        /// Largest payload in bytes.
        max_len: usize,
    },
}

impl Default for ValueConfig {
    fn default() -> Self {
        ValueConfig::Variable { max_len: 200 }
    }
}

/// Validated leaf configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeafConfig {
    /// Size of each leaf block in bytes.
    pub block_size: u32,
    /// Encoding of stored values.
    pub value: ValueConfig,
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            block_size: BlockSize::DEFAULT.value() as u32,
            value: ValueConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    block_size: Option<u32>,
    value: Option<ValueConfig>,
}

impl LeafConfig {
    /// Parses and validates a TOML document; missing fields take defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(contents).map_err(|err| LeafError::Config(err.to_string()))?;
        let defaults = LeafConfig::default();
        let config = LeafConfig {
            block_size: raw.block_size.unwrap_or(defaults.block_size),
            value: raw.value.unwrap_or(defaults.value),
        };
        config.check()?;
        Ok(config)
    }

    /// Reads `path`, falling back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let contents = fs::read_to_string(path).map_err(|err| {
                    LeafError::Config(format!("failed to read {}: {err}", path.display()))
                })?;
                Self::from_toml_str(&contents)
            }
            None => Ok(Self::default()),
        }
    }

    /// Renders the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| LeafError::Config(err.to_string()))
    }

    /// Block size as a validated [`BlockSize`].
    pub fn block_size(&self) -> Result<BlockSize> {
        BlockSize::new(self.block_size).map_err(|err| LeafError::Config(err.to_string()))
    }

    /// Builds the sizer described by this configuration.
    pub fn sizer(&self) -> Result<AnySizer> {
        let block_size = self.block_size()?;
        Ok(match self.value {
            ValueConfig::Fixed { len } => AnySizer::Fixed(FixedSizer::new(len, block_size)),
            ValueConfig::Variable { max_len } => {
                AnySizer::Variable(VarSizer::new(max_len, block_size))
            }
        })
    }

    /// Rejects geometries where a split could leave a half without room for
    /// one more maximum-size entry.
    fn check(&self) -> Result<()> {
        let sizer = self.sizer()?;
        if let ValueConfig::Fixed { len: 0 } = self.value {
            return Err(LeafError::Config("fixed values must be at least one byte".into()));
        }
        let usable = self.block_size as usize - HEADER_LEN;
        let entry = max_entry_cost(&sizer);
        if entry * 4 > usable {
            return Err(LeafError::Config(format!(
                "block of {} bytes cannot hold four {}-byte entries (keys up to {MAX_KEY_SIZE} bytes)",
                self.block_size, entry
            )));
        }
        tracing::debug!(
            target: "leafnode::config",
            block_size = self.block_size,
            max_entry = entry,
            "leaf configuration accepted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::ValueSizer;

    #[test]
    fn empty_document_uses_defaults() -> Result<()> {
        let config = LeafConfig::from_toml_str("")?;
        assert_eq!(config, LeafConfig::default());
        assert_eq!(config.sizer()?.block_size(), BlockSize::DEFAULT);
        Ok(())
    }

    #[test]
    fn parses_fixed_values() -> Result<()> {
        let config = LeafConfig::from_toml_str(
            r#"
            block_size = 2048
            [value]
            kind = "fixed"
            len = 8
            "#,
        )?;
        assert_eq!(config.value, ValueConfig::Fixed { len: 8 });
        let sizer = config.sizer()?;
        assert_eq!(sizer.max_possible_size(), 8);
        assert_eq!(sizer.block_size().value(), 2048);
        Ok(())
    }

    #[test]
    fn round_trips_through_toml() -> Result<()> {
        let config = LeafConfig {
            block_size: 8192,
            value: ValueConfig::Variable { max_len: 500 },
        };
        assert_eq!(LeafConfig::from_toml_str(&config.to_toml_string()?)?, config);
        Ok(())
    }

    #[test]
    fn rejects_bad_geometry() {
        let too_small = "block_size = 100";
        assert!(matches!(
            LeafConfig::from_toml_str(too_small),
            Err(LeafError::Config(_))
        ));
        let crowded = "block_size = 1024\n[value]\nkind = \"variable\"\nmax_len = 1000\n";
        assert!(matches!(
            LeafConfig::from_toml_str(crowded),
            Err(LeafError::Config(_))
        ));
        assert!(matches!(
            LeafConfig::from_toml_str("page_size = 4096"),
            Err(LeafError::Config(_))
        ));
    }

    #[test]
    fn load_reads_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("leaf.toml");
        fs::write(&path, "block_size = 2048\n")?;
        assert_eq!(LeafConfig::load(Some(&path))?.block_size, 2048);
        assert_eq!(LeafConfig::load(None)?, LeafConfig::default());
        assert!(LeafConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
        Ok(())
    }
}
