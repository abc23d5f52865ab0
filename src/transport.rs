//! # Transport Abstraction
//!
//! The workbench never touches sockets or serial ports itself. It talks to a
//! [`ModbusTransport`], which performs the request/response exchange and hands
//! back word or bit payloads. Framing, CRC and socket handling belong to the
//! implementation behind the trait.
//!
//! ## Contract
//!
//! - `request` returns the device reply. A Modbus exception travels inside the
//!   reply (`ModbusResponse::exception_code`); a missing reply is
//!   `ModbusError::Timeout`; a dead link is `ModbusError::Connection` or
//!   `ModbusError::Io`.
//! - `probe` is the discovery primitive used by the device scanner. The default
//!   implementation issues a one-register read under a deadline.
//! - In slave mode the transport reports writes made by a remote master as
//!   [`ExternalWrite`] events.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use voltage_modbus_workbench::transport::{ModbusTransport, ProbeOutcome};
//!
//! async fn is_alive(transport: &mut impl ModbusTransport, slave_id: u8) -> bool {
//!     matches!(
//!         transport.probe(slave_id, 0, Duration::from_millis(200)).await,
//!         Ok(ProbeOutcome::Reply { .. })
//!     )
//! }
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
use crate::register_store::RegisterKind;

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionParams {
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    Rtu {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_tcp_port() -> u16 {
    crate::DEFAULT_TCP_PORT
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams::Tcp {
            host: "127.0.0.1".to_string(),
            port: crate::DEFAULT_TCP_PORT,
        }
    }
}

impl ConnectionParams {
    /// Serial links are half-duplex; only one request may be in flight
    pub fn is_serial(&self) -> bool {
        matches!(self, ConnectionParams::Rtu { .. })
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionParams::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ConnectionParams::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity {
                    Parity::None => 'N',
                    Parity::Odd => 'O',
                    Parity::Even => 'E',
                };
                write!(f, "rtu://{} {} {}{}{}", port, baud_rate, data_bits, parity, stop_bits)
            }
        }
    }
}

/// Values written by a remote master
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalValues {
    Words(Vec<u16>),
    Bits(Vec<bool>),
}

/// Slave-mode receive event: a remote master changed the local register map
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalWrite {
    pub kind: RegisterKind,
    pub start_address: u16,
    pub values: ExternalValues,
}

impl ExternalWrite {
    pub fn registers(start_address: u16, words: Vec<u16>) -> Self {
        Self {
            kind: RegisterKind::HoldingRegisters,
            start_address,
            values: ExternalValues::Words(words),
        }
    }

    pub fn coils(start_address: u16, bits: Vec<bool>) -> Self {
        Self {
            kind: RegisterKind::Coils,
            start_address,
            values: ExternalValues::Bits(bits),
        }
    }

    /// Derive the event from a write request the local node just served
    pub fn from_request(request: &ModbusRequest) -> Option<Self> {
        use crate::protocol::Payload;

        match (&request.payload, request.function) {
            (Payload::Words(words), ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters) => {
                Some(Self::registers(request.address, words.clone()))
            }
            (Payload::Bits(bits), ModbusFunction::WriteSingleCoil | ModbusFunction::WriteMultipleCoils) => {
                Some(Self::coils(request.address, bits.clone()))
            }
            _ => None,
        }
    }
}

/// Classified outcome of a discovery probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// A valid reply arrived
    Reply { elapsed: Duration },
    /// The device answered with a Modbus exception
    Exception { code: u8, elapsed: Duration },
    /// Nothing usable arrived before the deadline
    Timeout { elapsed: Duration },
}

impl ProbeOutcome {
    pub fn elapsed(&self) -> Duration {
        match self {
            ProbeOutcome::Reply { elapsed }
            | ProbeOutcome::Exception { elapsed, .. }
            | ProbeOutcome::Timeout { elapsed } => *elapsed,
        }
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub exceptions: u64,
    pub errors: u64,
    pub timeouts: u64,
}

impl TransportStats {
    /// Account for the outcome of one request
    pub fn record(&mut self, result: &ModbusResult<ModbusResponse>) {
        self.requests_sent += 1;
        match result {
            Ok(response) if response.is_exception() => {
                self.responses_received += 1;
                self.exceptions += 1;
            }
            Ok(_) => self.responses_received += 1,
            Err(ModbusError::Timeout { .. }) => self.timeouts += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Request/response transport consumed by the workbench core
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Open the link
    ///
    /// Returns `Ok(false)` when the peer refused without a transport error.
    async fn connect(&mut self, params: &ConnectionParams) -> ModbusResult<bool>;

    /// Close the link; closing an already closed link is not an error
    async fn disconnect(&mut self) -> ModbusResult<()>;

    /// Send a Modbus request and wait for the reply
    ///
    /// # Errors
    ///
    /// - `ModbusError::Timeout` - no reply before the transport's deadline
    /// - `ModbusError::Connection` / `ModbusError::Io` - the link is gone
    /// - `ModbusError::Frame` - the reply could not be decoded
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse>;

    /// Check if the transport connection is active
    fn is_connected(&self) -> bool;

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;

    /// Minimal read used to discover responsive slave ids
    ///
    /// Timeouts, exceptions and malformed replies are classified rather than
    /// returned as errors. Only a lost link is an error.
    async fn probe(&mut self, slave_id: SlaveId, address: u16, deadline: Duration) -> ModbusResult<ProbeOutcome> {
        let request = ModbusRequest::new_read(slave_id, ModbusFunction::ReadHoldingRegisters, address, 1);
        let started = Instant::now();
        let result = timeout(deadline, self.request(&request)).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Err(_) => ProbeOutcome::Timeout { elapsed },
            Ok(Ok(response)) => match response.exception_code {
                Some(code) => ProbeOutcome::Exception { code, elapsed },
                None if response.slave_id != slave_id
                    || response.function != request.function
                    || response.words().map_or(true, |words| words.is_empty()) =>
                {
                    debug!(slave_id, "malformed probe reply");
                    ProbeOutcome::Timeout { elapsed }
                }
                None => ProbeOutcome::Reply { elapsed },
            },
            Ok(Err(ModbusError::Exception { code, .. })) => ProbeOutcome::Exception { code, elapsed },
            Ok(Err(error)) if error.is_transport_failure() => {
                info!(slave_id, %error, "link lost while probing");
                return Err(error);
            }
            Ok(Err(error)) => {
                debug!(slave_id, %error, "probe produced no usable reply");
                ProbeOutcome::Timeout { elapsed }
            }
        };
        Ok(outcome)
    }
}
