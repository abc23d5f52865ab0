/// Modbus protocol definitions and data structures
///
/// Function codes, exception codes and the request/response structures that
/// cross the transport boundary. Framing (MBAP, RTU CRC) is the transport's
/// business; payloads here are already word or bit sequences.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        !self.is_read_function()
    }

    /// Check if the function addresses single bits
    pub fn is_bit_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteMultipleCoils
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Data carried by a request or response
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Words(Vec<u16>),
    Bits(Vec<bool>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Words(words) => words.len(),
            Payload::Bits(bits) => bits.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Modbus request structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub payload: Payload,
}

impl ModbusRequest {
    /// Create a new read request
    pub fn new_read(slave_id: SlaveId, function: ModbusFunction, address: ModbusAddress, quantity: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            payload: Payload::Empty,
        }
    }

    /// Create a new write request
    ///
    /// Single-item functions always carry a quantity of 1.
    pub fn new_write(slave_id: SlaveId, function: ModbusFunction, address: ModbusAddress, payload: Payload) -> Self {
        let quantity = match function {
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
            _ => payload.len() as u16,
        };

        Self {
            slave_id,
            function,
            address,
            quantity,
            payload,
        }
    }

    /// Validate the request
    pub fn validate(&self) -> ModbusResult<()> {
        if self.slave_id == 0 || self.slave_id > crate::MAX_SLAVE_ID {
            return Err(ModbusError::invalid_data(format!("Invalid slave ID: {}", self.slave_id)));
        }

        if self.quantity == 0 {
            return Err(ModbusError::invalid_data("Quantity cannot be zero".to_string()));
        }

        let limit = if self.function.is_bit_function() {
            crate::MAX_COILS_PER_REQUEST
        } else {
            crate::MAX_REGISTERS_PER_REQUEST
        };
        if self.quantity > limit {
            return Err(ModbusError::invalid_data(format!(
                "Too many items for {}: {} (max {})",
                self.function, self.quantity, limit
            )));
        }

        if (self.address as u32 + self.quantity as u32) > 65536 {
            return Err(ModbusError::invalid_address(self.address, self.quantity));
        }

        match (&self.payload, self.function) {
            (Payload::Empty, function) if function.is_read_function() => Ok(()),
            (Payload::Bits(bits), ModbusFunction::WriteSingleCoil | ModbusFunction::WriteMultipleCoils)
                if !bits.is_empty() =>
            {
                Ok(())
            }
            (Payload::Words(words), ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters)
                if !words.is_empty() =>
            {
                Ok(())
            }
            _ => Err(ModbusError::invalid_data(format!(
                "Payload does not match {}",
                self.function
            ))),
        }
    }
}

/// Modbus response structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub payload: Payload,
    /// Raw exception code, kept even when it is not a standard one
    pub exception_code: Option<u8>,
}

impl ModbusResponse {
    /// Create a successful response
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, payload: Payload) -> Self {
        Self {
            slave_id,
            function,
            payload,
            exception_code: None,
        }
    }

    /// Create an exception response
    pub fn new_exception(slave_id: SlaveId, function: ModbusFunction, exception_code: u8) -> Self {
        Self {
            slave_id,
            function,
            payload: Payload::Empty,
            exception_code: Some(exception_code),
        }
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception_code.is_some()
    }

    pub fn exception(&self) -> Option<ModbusException> {
        self.exception_code.and_then(ModbusException::from_u8)
    }

    /// Turn an exception reply into an error
    pub fn into_result(self) -> ModbusResult<Self> {
        match self.exception_code {
            Some(code) => Err(ModbusError::exception(self.function.to_u8(), code)),
            None => Ok(self),
        }
    }

    /// Register words carried by the response
    pub fn words(&self) -> ModbusResult<&[u16]> {
        if let Some(code) = self.exception_code {
            return Err(ModbusError::exception(self.function.to_u8(), code));
        }
        match &self.payload {
            Payload::Words(words) => Ok(words),
            other => Err(ModbusError::frame(format!(
                "{} reply carries no register words ({:?})",
                self.function, other
            ))),
        }
    }

    /// Bits carried by the response
    pub fn bits(&self) -> ModbusResult<&[bool]> {
        if let Some(code) = self.exception_code {
            return Err(ModbusError::exception(self.function.to_u8(), code));
        }
        match &self.payload {
            Payload::Bits(bits) => Ok(bits),
            other => Err(ModbusError::frame(format!(
                "{} reply carries no bits ({:?})",
                self.function, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert!(ModbusFunction::from_u8(0xFF).is_err());
        assert!(ModbusFunction::WriteMultipleCoils.is_bit_function());
        assert!(ModbusFunction::WriteSingleRegister.is_write_function());
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(ModbusException::from_u8(0x02).unwrap(), ModbusException::IllegalDataAddress);
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
        assert!(ModbusException::from_u8(0x07).is_none());
    }

    #[test]
    fn test_request_validation() {
        let valid = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 100, 10);
        assert!(valid.validate().is_ok());

        let invalid_slave = ModbusRequest::new_read(0, ModbusFunction::ReadHoldingRegisters, 100, 10);
        assert!(invalid_slave.validate().is_err());

        let too_many = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 100, 200);
        assert!(too_many.validate().is_err());

        let coils = ModbusRequest::new_read(1, ModbusFunction::ReadCoils, 0, 2000);
        assert!(coils.validate().is_ok());

        let past_end = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 65530, 10);
        assert!(past_end.validate().is_err());
    }

    #[test]
    fn test_write_request_quantity() {
        let single = ModbusRequest::new_write(
            1,
            ModbusFunction::WriteSingleRegister,
            4,
            Payload::Words(vec![0x1234]),
        );
        assert_eq!(single.quantity, 1);
        assert!(single.validate().is_ok());

        let multiple = ModbusRequest::new_write(
            1,
            ModbusFunction::WriteMultipleCoils,
            0,
            Payload::Bits(vec![true, false, true]),
        );
        assert_eq!(multiple.quantity, 3);
        assert!(multiple.validate().is_ok());

        let mismatched = ModbusRequest::new_write(
            1,
            ModbusFunction::WriteMultipleRegisters,
            0,
            Payload::Bits(vec![true]),
        );
        assert!(mismatched.validate().is_err());
    }

    #[test]
    fn test_response_payloads() {
        let response = ModbusResponse::new_success(
            1,
            ModbusFunction::ReadHoldingRegisters,
            Payload::Words(vec![0x1234, 0x5678]),
        );
        assert_eq!(response.words().unwrap(), &[0x1234, 0x5678]);
        assert!(response.bits().is_err());

        let response = ModbusResponse::new_exception(3, ModbusFunction::ReadHoldingRegisters, 0x02);
        assert!(response.is_exception());
        assert_eq!(response.exception(), Some(ModbusException::IllegalDataAddress));
        match response.into_result() {
            Err(ModbusError::Exception { function, code, .. }) => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
