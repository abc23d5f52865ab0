/// Utility functions and helpers
///
/// Validation of slave ids and address ranges, formatting helpers for logs and
/// display, and test logger setup.

use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Validate slave ID (1-247)
    pub fn validate_slave_id(slave_id: u8) -> ModbusResult<()> {
        if slave_id < crate::MIN_SLAVE_ID || slave_id > crate::MAX_SLAVE_ID {
            return Err(ModbusError::invalid_data(format!(
                "Invalid slave ID: {} (must be {}-{})",
                slave_id,
                crate::MIN_SLAVE_ID,
                crate::MAX_SLAVE_ID
            )));
        }
        Ok(())
    }

    /// Validate an inclusive range of slave ids for a scan
    pub fn validate_scan_range(first: u8, last: u8) -> ModbusResult<()> {
        validate_slave_id(first)?;
        validate_slave_id(last)?;
        if first > last {
            return Err(ModbusError::configuration(format!(
                "Scan range is empty: {} > {}",
                first, last
            )));
        }
        Ok(())
    }

    /// Validate address range
    pub fn validate_address_range(start: u16, count: u16) -> ModbusResult<()> {
        if count == 0 {
            return Err(ModbusError::invalid_address(start, count));
        }

        if (start as u32 + count as u32) > 65536 {
            return Err(ModbusError::invalid_address(start, count));
        }

        Ok(())
    }

    /// Validate register count for read operations
    pub fn validate_register_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "Invalid register count: {} (must be 1-{})",
                count,
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Validate coil count for read operations
    pub fn validate_coil_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_COILS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "Invalid coil count: {} (must be 1-{})",
                count,
                crate::MAX_COILS_PER_REQUEST
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Hex dump of the words' bytes in wire-word layout (low byte first)
    pub fn words_to_byte_hex(words: &[u16]) -> String {
        let mut bytes = vec![0u8; words.len() * 2];
        LittleEndian::write_u16_into(words, &mut bytes);
        hex::encode_upper(bytes)
    }

    /// Format bits as a compact 0/1 string
    pub fn bits_to_string(bits: &[bool]) -> String {
        bits.iter().map(|&bit| if bit { '1' } else { '0' }).collect()
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(validation::validate_slave_id(1).is_ok());
        assert!(validation::validate_slave_id(247).is_ok());
        assert!(validation::validate_slave_id(0).is_err());
        assert!(validation::validate_slave_id(248).is_err());

        assert!(validation::validate_scan_range(1, 247).is_ok());
        assert!(validation::validate_scan_range(10, 9).is_err());

        assert!(validation::validate_address_range(0, 10).is_ok());
        assert!(validation::validate_address_range(65530, 5).is_ok());
        assert!(validation::validate_address_range(65530, 10).is_err());

        assert!(validation::validate_register_count(125).is_ok());
        assert!(validation::validate_register_count(126).is_err());
        assert!(validation::validate_coil_count(0).is_err());
    }

    #[test]
    fn test_formatting() {
        let registers = vec![0x1234, 0x5678];
        assert_eq!(format::registers_to_hex(&registers), "1234 5678");
        assert_eq!(format::words_to_byte_hex(&registers), "34127856");
        assert_eq!(format::bits_to_string(&[true, false, true]), "101");

        let duration = Duration::from_millis(1500);
        assert_eq!(format::format_duration(duration), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(42)), "42ms");
    }
}
