//! Workbench configuration
//!
//! Loaded from YAML or JSON. Every field has a default, so an empty document
//! is a valid configuration:
//!
//! ```yaml
//! reverse_word_order: false
//! highlight_duration_ms: 5000
//! local_slave_id: 1
//! scan:
//!   first_slave_id: 1
//!   last_slave_id: 247
//!   probe_timeout_ms: 200
//!   probe_address: 0
//! connection:
//!   type: rtu
//!   port: /dev/ttyUSB0
//!   baud_rate: 19200
//!   parity: Even
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::WordOrder;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::SlaveId;
use crate::scanner::ScanConfig;
use crate::transport::ConnectionParams;
use crate::utils::validation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkbenchConfig {
    /// Most-significant word first for multi-word values
    pub reverse_word_order: bool,
    /// How long externally written entries stay highlighted
    pub highlight_duration_ms: u64,
    /// Unit id the local node answers to in slave mode
    pub local_slave_id: SlaveId,
    pub scan: ScanConfig,
    pub connection: ConnectionParams,
}

impl Default for WorkbenchConfig {
    fn default() -> Self {
        Self {
            reverse_word_order: false,
            highlight_duration_ms: crate::DEFAULT_HIGHLIGHT_MS,
            local_slave_id: 1,
            scan: ScanConfig::default(),
            connection: ConnectionParams::default(),
        }
    }
}

impl WorkbenchConfig {
    pub fn from_yaml_str(yaml: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`, `.yml` or `.json` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ModbusError::configuration(format!("{} has no extension", path.display())))?;
        let parse: fn(&str) -> ModbusResult<Self> = match extension {
            "yaml" | "yml" => Self::from_yaml_str,
            "json" => Self::from_json_str,
            other => {
                return Err(ModbusError::configuration(format!(
                    "Unsupported config file format: {}",
                    other
                )))
            }
        };
        let content = std::fs::read_to_string(path)?;
        parse(&content)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        self.scan.validate()?;
        validation::validate_slave_id(self.local_slave_id)?;
        if self.highlight_duration_ms == 0 {
            return Err(ModbusError::configuration("highlight_duration_ms must be positive"));
        }
        if let ConnectionParams::Rtu { data_bits, stop_bits, .. } = &self.connection {
            if !(5..=8).contains(data_bits) {
                return Err(ModbusError::configuration(format!("Invalid data bits: {}", data_bits)));
            }
            if !(1..=2).contains(stop_bits) {
                return Err(ModbusError::configuration(format!("Invalid stop bits: {}", stop_bits)));
            }
        }
        Ok(())
    }

    pub fn word_order(&self) -> WordOrder {
        WordOrder::from_reverse(self.reverse_word_order)
    }

    pub fn highlight_duration(&self) -> Duration {
        Duration::from_millis(self.highlight_duration_ms)
    }
}
