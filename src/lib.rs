//! # Voltage Modbus Workbench - Register Model and Codec Engine
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! The core of an interactive Modbus workbench: the operator acts as master,
//! slave or listener, and this crate turns typed values into register words
//! and back, keeps the local register map consistent, scans the bus for
//! responsive devices and absorbs writes made by remote masters.
//!
//! ## Features
//!
//! - **Typed codec**: UInt16/Int16/UInt32/Int32/Float32/Float64, ASCII strings,
//!   hex and binary words, with a switchable word order
//! - **Register store**: four tables with contiguous address allocation and
//!   change sets instead of per-field notifications
//! - **Write builder / response decoder**: all-or-nothing write batches and
//!   addressed display items for read replies
//! - **Device scanner**: sequential, cancellable probing of slave ids 1-247
//! - **External write reconciler**: multi-word reassembly with one shared
//!   highlight timer
//!
//! The physical transport (sockets, serial framing, CRC) lives behind the
//! [`ModbusTransport`] trait. [`simulator::SimulatedBus`] implements it in memory.
//!
//! ## Quick Start
//!
//! ```rust
//! use voltage_modbus_workbench::codec::{self, DataType, WordOrder};
//! use voltage_modbus_workbench::register_store::{RegisterDefinition, RegisterKind, RegisterStore};
//!
//! let words = codec::encode("3.5", DataType::Float32, WordOrder::default())?;
//! assert_eq!(codec::display(&words, DataType::Float32, WordOrder::default()), "3.5");
//!
//! let mut store = RegisterStore::new();
//! for (address, data_type) in [(7, DataType::UInt16), (20, DataType::Float32), (40, DataType::UInt16)] {
//!     store.add_register(RegisterKind::HoldingRegisters, RegisterDefinition::new(address, data_type))?;
//! }
//! store.resequence(RegisterKind::HoldingRegisters)?;
//! let addresses: Vec<u16> = store
//!     .registers(RegisterKind::HoldingRegisters)
//!     .iter()
//!     .map(|entry| entry.address())
//!     .collect();
//! assert_eq!(addresses, vec![0, 1, 3]);
//! # Ok::<(), voltage_modbus_workbench::ModbusError>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! operator input ──► WriteRequestBuilder ──► transport ──► ResponseDecoder ──► display items
//!
//! transport (slave mode) ──► ExternalWriteReconciler ──► RegisterStore ──► ChangeSet
//!
//! DeviceScanner ──► transport (probe) ──► ScanEvent stream
//!
//!         all RegisterStore mutation is serialized by session::Session
//! ```

/// Core error types and result handling
pub mod error;

/// Typed value <-> register word conversion
pub mod codec;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Transport abstraction consumed by the workbench
pub mod transport;

/// Logical register map with address allocation
pub mod register_store;

/// Flat register image served by the local node
pub mod register_bank;

/// Outgoing write batches
pub mod write_builder;

/// Inbound payload decoding
pub mod response_decoder;

/// Slave id discovery
pub mod scanner;

/// Slave-mode external write handling
pub mod reconciler;

/// In-memory transport
pub mod simulator;

/// Master-mode client
pub mod client;

/// Single dispatch loop
pub mod session;

/// Workbench configuration
pub mod config;

/// Utility functions
pub mod utils;

// Re-export main types for convenience
pub use client::{ModbusClient, ModbusMaster};
pub use codec::{DataType, RegisterValue, WordOrder};
pub use config::WorkbenchConfig;
pub use error::{ModbusError, ModbusResult};
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse, Payload};
pub use reconciler::{ExternalWriteReconciler, HighlightTracker};
pub use register_bank::{ModbusRegisterBank, RegisterBankStats};
pub use register_store::{ChangeOrigin, ChangeSet, RegisterKind, RegisterStore};
pub use response_decoder::{ModbusResponseItem, ResponseDecoder};
pub use scanner::{DeviceScanResult, DeviceScanner, ScanConfig, ScanEvent, ScanStatus, ScanSummary};
pub use session::{Session, SessionEvent, SessionHandle, SessionUpdate};
pub use transport::{ConnectionParams, ExternalWrite, ModbusTransport, TransportStats};
pub use write_builder::{WriteDataItem, WriteFunction, WriteRequestBuilder};

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of coils that can be read/written in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read/written in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Lowest unit id a slave may use
pub const MIN_SLAVE_ID: u8 = 1;

/// Highest unit id a slave may use
pub const MAX_SLAVE_ID: u8 = 247;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// How long externally written entries stay highlighted
pub const DEFAULT_HIGHLIGHT_MS: u64 = 5000;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Workbench v{} - Modbus register model and codec engine by Evan Liu", VERSION)
}
