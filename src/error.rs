//! # Workbench Error Handling
//!
//! One error type covers every failure the workbench core can report: malformed
//! operator input, transport problems, device exceptions and register map
//! inconsistencies.
//!
//! ## Error Categories
//!
//! ### Input Errors
//! - **Format Errors**: typed text that cannot be encoded (`"abc"` as `UInt16`).
//!   A write that hits one is aborted as a whole; no partial payload leaves the core.
//!
//! ### Transport Errors
//! - **I/O / Connection Errors**: the link was lost mid-operation. These stop an
//!   active scan and are propagated to the caller.
//! - **Timeout Errors**: no reply before the deadline. The scanner reports these
//!   as a `Timeout` classification rather than a failure.
//!
//! ### Protocol Errors
//! - **Exception Responses**: standard Modbus exception codes from devices.
//! - **Frame / Protocol Errors**: malformed replies.
//!
//! ### Register Map Errors
//! - **Unknown Entry / Duplicate Address**: store lookups and insertions that
//!   violate the one-entry-per-address rule.
//!
//! ## Classification
//!
//! ```rust
//! use voltage_modbus_workbench::{DataType, ModbusError};
//!
//! let err = ModbusError::format(DataType::UInt16, "abc", "invalid digit").with_item_index(1);
//! assert!(err.is_format_error());
//! assert!(!err.is_recoverable());
//!
//! let err = ModbusError::timeout("probe slave 7", 200);
//! assert!(err.is_transport_error());
//! assert!(!err.is_transport_failure());
//! ```

use thiserror::Error;

use crate::codec::DataType;
use crate::register_store::RegisterKind;

/// Result type alias for workbench operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Workbench error types
///
/// Each variant is scoped to the operation that raised it; none of them is
/// meant to terminate the process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors (network, serial)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection lost or refused
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation exceeded its deadline
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Modbus protocol violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Unsupported or unexpected function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Address range validation failures
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Data validation errors
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Modbus exception response
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    /// - 0x08: Memory Parity Error
    /// - 0x0A: Gateway Path Unavailable
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Malformed typed input
    ///
    /// `index` is set when the text came from a write batch, so the caller can
    /// point the operator at the offending row.
    #[error("Format error{}: cannot encode {input:?} as {data_type}: {reason}", item_suffix(.index))]
    Format {
        index: Option<usize>,
        data_type: DataType,
        input: String,
        reason: String,
    },

    /// A scan was requested while another one is still running
    #[error("Device scan already in progress")]
    ScanInProgress,

    /// No entry of the given kind lives at the address
    #[error("No {kind} entry at address {address}")]
    UnknownEntry { kind: RegisterKind, address: u16 },

    /// An entry of the given kind already occupies the address
    #[error("Address {address} already used in {kind}")]
    DuplicateAddress { kind: RegisterKind, address: u16 },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn item_suffix(index: &Option<usize>) -> String {
    match index {
        Some(index) => format!(" in item {}", index),
        None => String::new(),
    }
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Standard exception codes are mapped to their usual names.
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: exception_text(code).to_string(),
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a format error for text that does not parse as `data_type`
    ///
    /// # Arguments
    ///
    /// * `data_type` - Type the text was supposed to encode as
    /// * `input` - The offending text
    /// * `reason` - Why the parse failed
    pub fn format<I: Into<String>, R: Into<String>>(data_type: DataType, input: I, reason: R) -> Self {
        Self::Format {
            index: None,
            data_type,
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Attach a write-batch item index to a format error
    ///
    /// Other variants are returned unchanged.
    pub fn with_item_index(self, item: usize) -> Self {
        match self {
            Self::Format { data_type, input, reason, .. } => Self::Format {
                index: Some(item),
                data_type,
                input,
                reason,
            },
            other => other,
        }
    }

    /// Create an unknown entry error
    pub fn unknown_entry(kind: RegisterKind, address: u16) -> Self {
        Self::UnknownEntry { kind, address }
    }

    /// Create a duplicate address error
    pub fn duplicate_address(kind: RegisterKind, address: u16) -> Self {
        Self::DuplicateAddress { kind, address }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_modbus_workbench::ModbusError;
    ///
    /// assert!(ModbusError::timeout("read operation", 5000).is_recoverable());
    /// assert!(!ModbusError::invalid_function(0x99).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::ScanInProgress => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if the link itself is gone
    ///
    /// Unlike a timeout, a transport failure ends any running scan.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Connection { .. })
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::InvalidFunction { .. } | Self::Exception { .. } | Self::Frame { .. }
        )
    }

    /// Check if the error comes from malformed typed input
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::Format { .. })
    }
}

/// Human-readable name of a Modbus exception code
pub fn exception_text(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Tokio's elapsed error carries no duration; callers that know the deadline
/// should build the timeout error themselves.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
