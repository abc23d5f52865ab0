//! # Simulated Bus
//!
//! An in-memory [`ModbusTransport`] backed by one [`ModbusRegisterBank`] per
//! slave id. Each simulated slave either answers from its bank, answers every
//! request with a fixed exception code, or stays silent. One slave may be
//! marked as the local node: writes served by it are reported as
//! [`ExternalWrite`] events, the way a slave-mode transport reports writes
//! from a remote master.
//!
//! ```rust
//! use voltage_modbus_workbench::simulator::{SimulatedBus, SlaveBehaviour};
//!
//! let bus = SimulatedBus::new()
//!     .with_slave(42, SlaveBehaviour::Respond)
//!     .with_slave(99, SlaveBehaviour::Exception(0x01));
//! assert_eq!(bus.slave_ids(), vec![42, 99]);
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, Payload, SlaveId};
use crate::register_bank::ModbusRegisterBank;
use crate::register_store::RegisterKind;
use crate::transport::{ConnectionParams, ExternalWrite, ModbusTransport, TransportStats};

/// How a simulated slave treats requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveBehaviour {
    /// Serve reads and writes from the register bank
    Respond,
    /// Reply to everything with this exception code
    Exception(u8),
    /// Never reply
    Silent,
}

#[derive(Debug, Clone)]
struct SimulatedSlave {
    behaviour: SlaveBehaviour,
    bank: ModbusRegisterBank,
}

/// In-memory bus of simulated slaves
#[derive(Debug, Default)]
pub struct SimulatedBus {
    slaves: BTreeMap<SlaveId, SimulatedSlave>,
    local: Option<(SlaveId, mpsc::UnboundedSender<ExternalWrite>)>,
    connected: bool,
    latency: Duration,
    timeout_ms: u64,
    stats: TransportStats,
}

/// Table a function code reads or writes
fn function_kind(function: ModbusFunction) -> RegisterKind {
    match function {
        ModbusFunction::ReadCoils | ModbusFunction::WriteSingleCoil | ModbusFunction::WriteMultipleCoils => {
            RegisterKind::Coils
        }
        ModbusFunction::ReadDiscreteInputs => RegisterKind::DiscreteInputs,
        ModbusFunction::ReadInputRegisters => RegisterKind::InputRegisters,
        ModbusFunction::ReadHoldingRegisters
        | ModbusFunction::WriteSingleRegister
        | ModbusFunction::WriteMultipleRegisters => RegisterKind::HoldingRegisters,
    }
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            ..Self::default()
        }
    }

    /// Add a slave with an empty register bank
    pub fn with_slave(mut self, slave_id: SlaveId, behaviour: SlaveBehaviour) -> Self {
        self.add_slave(slave_id, ModbusRegisterBank::new(), behaviour);
        self
    }

    /// Delay applied to every exchange
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn add_slave(&mut self, slave_id: SlaveId, bank: ModbusRegisterBank, behaviour: SlaveBehaviour) {
        self.slaves.insert(slave_id, SimulatedSlave { behaviour, bank });
    }

    /// Mark `slave_id` as the local node and report writes served by it
    ///
    /// The bank is shared, so the caller keeps its own handle to it.
    pub fn attach_local(
        &mut self,
        slave_id: SlaveId,
        bank: ModbusRegisterBank,
        external_writes: mpsc::UnboundedSender<ExternalWrite>,
    ) {
        self.add_slave(slave_id, bank, SlaveBehaviour::Respond);
        self.local = Some((slave_id, external_writes));
    }

    pub fn set_behaviour(&mut self, slave_id: SlaveId, behaviour: SlaveBehaviour) -> ModbusResult<()> {
        let slave = self
            .slaves
            .get_mut(&slave_id)
            .ok_or_else(|| ModbusError::configuration(format!("No simulated slave {}", slave_id)))?;
        slave.behaviour = behaviour;
        Ok(())
    }

    pub fn slave_bank(&self, slave_id: SlaveId) -> Option<&ModbusRegisterBank> {
        self.slaves.get(&slave_id).map(|slave| &slave.bank)
    }

    pub fn slave_ids(&self) -> Vec<SlaveId> {
        self.slaves.keys().copied().collect()
    }

    /// Drop the link as if the cable were pulled
    pub fn break_link(&mut self) {
        self.connected = false;
    }

    fn serve(bank: &ModbusRegisterBank, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let kind = function_kind(request.function);
        let payload = match (request.function, &request.payload) {
            (function, _) if function.is_read_function() => {
                if kind.is_bit() {
                    Payload::Bits(bank.read_bits(kind, request.address, request.quantity)?)
                } else {
                    Payload::Words(bank.read_words(kind, request.address, request.quantity)?)
                }
            }
            (_, Payload::Words(words)) => {
                bank.write_words(kind, request.address, words)?;
                Payload::Empty
            }
            (_, Payload::Bits(bits)) => {
                bank.write_bits(kind, request.address, bits)?;
                Payload::Empty
            }
            (function, Payload::Empty) => {
                return Ok(ModbusResponse::new_exception(
                    request.slave_id,
                    function,
                    ModbusException::IllegalDataValue.to_u8(),
                ))
            }
        };
        Ok(ModbusResponse::new_success(request.slave_id, request.function, payload))
    }

    async fn exchange(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        if !self.connected {
            return Err(ModbusError::connection("Simulated bus is not connected"));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let slave = match self.slaves.get(&request.slave_id) {
            Some(slave) => slave,
            None => {
                return Err(ModbusError::timeout(
                    format!("request to slave {}", request.slave_id),
                    self.timeout_ms,
                ))
            }
        };

        match slave.behaviour {
            SlaveBehaviour::Silent => Err(ModbusError::timeout(
                format!("request to slave {}", request.slave_id),
                self.timeout_ms,
            )),
            SlaveBehaviour::Exception(code) => Ok(ModbusResponse::new_exception(request.slave_id, request.function, code)),
            SlaveBehaviour::Respond => {
                if let Err(error) = request.validate() {
                    debug!("Slave {} rejected request: {}", request.slave_id, error);
                    return Ok(ModbusResponse::new_exception(
                        request.slave_id,
                        request.function,
                        ModbusException::IllegalDataAddress.to_u8(),
                    ));
                }
                let response = Self::serve(&slave.bank, request)?;
                self.report_external_write(request, &response);
                Ok(response)
            }
        }
    }

    fn report_external_write(&self, request: &ModbusRequest, response: &ModbusResponse) {
        let Some((local_id, sender)) = &self.local else {
            return;
        };
        if *local_id != request.slave_id || response.is_exception() {
            return;
        }
        if let Some(write) = ExternalWrite::from_request(request) {
            if sender.send(write).is_err() {
                debug!("External write dropped, no listener");
            }
        }
    }
}

#[async_trait]
impl ModbusTransport for SimulatedBus {
    async fn connect(&mut self, params: &ConnectionParams) -> ModbusResult<bool> {
        info!("Simulated bus connected ({}, {} slaves)", params, self.slaves.len());
        self.connected = true;
        Ok(true)
    }

    async fn disconnect(&mut self) -> ModbusResult<()> {
        if self.connected {
            info!("Simulated bus disconnected");
        }
        self.connected = false;
        Ok(())
    }

    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let result = self.exchange(request).await;
        self.stats.record(&result);
        result
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
