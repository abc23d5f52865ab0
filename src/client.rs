/// Master-mode client
///
/// Joins the write builder, the transport and the response decoder. The
/// transport sits behind an `Arc<tokio::sync::Mutex<_>>` shared with the
/// device scanner, so master requests and scan probes never overlap on the
/// half-duplex line.
///
/// Exception replies come back from the transport as responses; the client
/// turns them into `ModbusError::Exception`. A reply from another slave or for
/// another function is a `ModbusError::Protocol`.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;

use crate::codec::{DataType, WordOrder};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, Payload, SlaveId};
use crate::register_store::RegisterKind;
use crate::response_decoder::{ModbusResponseItem, ResponseDecoder};
use crate::transport::{ConnectionParams, ModbusTransport, TransportStats};
use crate::utils::{format, validation};
use crate::write_builder::{WritePayload, WriteRequestBuilder};

/// Trait defining the interface for Modbus client operations
///
/// Methods carry the function code in their name.
#[async_trait]
pub trait ModbusClient: Send + Sync {
    /// Read coils (function code 0x01)
    async fn read_01(&self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>>;

    /// Read discrete inputs (function code 0x02)
    async fn read_02(&self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>>;

    /// Read holding registers (function code 0x03)
    async fn read_03(&self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>>;

    /// Read input registers (function code 0x04)
    async fn read_04(&self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>>;

    /// Write single coil (function code 0x05)
    async fn write_05(&self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()>;

    /// Write single register (function code 0x06)
    async fn write_06(&self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()>;

    /// Write multiple coils (function code 0x0F)
    async fn write_0f(&self, slave_id: SlaveId, address: u16, values: &[bool]) -> ModbusResult<()>;

    /// Write multiple registers (function code 0x10)
    async fn write_10(&self, slave_id: SlaveId, address: u16, values: &[u16]) -> ModbusResult<()>;

    async fn is_connected(&self) -> bool;

    async fn close(&self) -> ModbusResult<()>;

    async fn get_stats(&self) -> TransportStats;
}

/// Workbench master over any transport
pub struct ModbusMaster<T: ModbusTransport> {
    transport: Arc<Mutex<T>>,
    word_order: WordOrder,
}

impl<T: ModbusTransport> Clone for ModbusMaster<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            word_order: self.word_order,
        }
    }
}

impl<T: ModbusTransport> ModbusMaster<T> {
    pub fn new(transport: T) -> Self {
        Self::from_shared(Arc::new(Mutex::new(transport)))
    }

    /// Wrap a transport that is already shared, e.g. with a scanner
    pub fn from_shared(transport: Arc<Mutex<T>>) -> Self {
        Self {
            transport,
            word_order: WordOrder::default(),
        }
    }

    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    pub fn set_word_order(&mut self, word_order: WordOrder) {
        self.word_order = word_order;
    }

    /// Handle to the shared transport
    pub fn transport(&self) -> Arc<Mutex<T>> {
        Arc::clone(&self.transport)
    }

    pub async fn connect(&self, params: &ConnectionParams) -> ModbusResult<bool> {
        let connected = self.transport.lock().await.connect(params).await?;
        debug!("Connect to {}: {}", params, connected);
        Ok(connected)
    }

    pub async fn disconnect(&self) -> ModbusResult<()> {
        self.transport.lock().await.disconnect().await
    }

    /// Execute a raw request
    ///
    /// The request is validated first. An exception reply is returned as
    /// `ModbusError::Exception`.
    pub async fn execute_request(&self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.validate()?;
        debug!(
            "-> slave {} {} @{} x{}",
            request.slave_id, request.function, request.address, request.quantity
        );
        let response = self.transport.lock().await.request(request).await?;
        if response.slave_id != request.slave_id || response.function != request.function {
            return Err(ModbusError::protocol(format!(
                "expected {} from slave {}, got {} from slave {}",
                request.function, request.slave_id, response.function, response.slave_id
            )));
        }
        match &response.payload {
            Payload::Words(words) => debug!("<- slave {} [{}]", response.slave_id, format::registers_to_hex(words)),
            Payload::Bits(bits) => debug!("<- slave {} [{}]", response.slave_id, format::bits_to_string(bits)),
            Payload::Empty => {}
        }
        response.into_result()
    }

    /// Read a table and decode it as `data_type`
    pub async fn read_items(
        &self,
        slave_id: SlaveId,
        kind: RegisterKind,
        address: u16,
        quantity: u16,
        data_type: DataType,
    ) -> ModbusResult<Vec<ModbusResponseItem>> {
        let request = ModbusRequest::new_read(slave_id, kind.read_function(), address, quantity);
        let response = self.execute_request(&request).await?;
        ResponseDecoder::new(data_type, self.word_order).decode(&response, address)
    }

    /// Build the batch and send it
    ///
    /// A batch item that fails to parse aborts before anything is sent.
    /// Returns the number of words or coils written.
    pub async fn write(&self, slave_id: SlaveId, builder: &WriteRequestBuilder) -> ModbusResult<usize> {
        let request = builder.build_request(slave_id)?;
        self.execute_request(&request).await?;
        Ok(request.payload.len())
    }

    async fn read_words(&self, slave_id: SlaveId, function: ModbusFunction, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        validation::validate_register_count(quantity)?;
        let request = ModbusRequest::new_read(slave_id, function, address, quantity);
        let response = self.execute_request(&request).await?;
        Ok(response.words()?.to_vec())
    }

    async fn read_bits(&self, slave_id: SlaveId, function: ModbusFunction, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        validation::validate_coil_count(quantity)?;
        let request = ModbusRequest::new_read(slave_id, function, address, quantity);
        let response = self.execute_request(&request).await?;
        let mut bits = response.bits()?.to_vec();
        bits.truncate(quantity as usize);
        Ok(bits)
    }

    async fn send_write(&self, slave_id: SlaveId, function: ModbusFunction, address: u16, payload: WritePayload) -> ModbusResult<()> {
        let request = ModbusRequest::new_write(slave_id, function, address, payload.into());
        self.execute_request(&request).await?;
        Ok(())
    }
}

#[async_trait]
impl<T: ModbusTransport + 'static> ModbusClient for ModbusMaster<T> {
    async fn read_01(&self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(slave_id, ModbusFunction::ReadCoils, address, quantity).await
    }

    async fn read_02(&self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(slave_id, ModbusFunction::ReadDiscreteInputs, address, quantity).await
    }

    async fn read_03(&self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_words(slave_id, ModbusFunction::ReadHoldingRegisters, address, quantity).await
    }

    async fn read_04(&self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_words(slave_id, ModbusFunction::ReadInputRegisters, address, quantity).await
    }

    async fn write_05(&self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()> {
        self.send_write(slave_id, ModbusFunction::WriteSingleCoil, address, WritePayload::Coils(vec![value]))
            .await
    }

    async fn write_06(&self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()> {
        self.send_write(slave_id, ModbusFunction::WriteSingleRegister, address, WritePayload::Registers(vec![value]))
            .await
    }

    async fn write_0f(&self, slave_id: SlaveId, address: u16, values: &[bool]) -> ModbusResult<()> {
        validation::validate_coil_count(values.len() as u16)?;
        self.send_write(slave_id, ModbusFunction::WriteMultipleCoils, address, WritePayload::Coils(values.to_vec()))
            .await
    }

    async fn write_10(&self, slave_id: SlaveId, address: u16, values: &[u16]) -> ModbusResult<()> {
        validation::validate_register_count(values.len() as u16)?;
        self.send_write(
            slave_id,
            ModbusFunction::WriteMultipleRegisters,
            address,
            WritePayload::Registers(values.to_vec()),
        )
        .await
    }

    async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    async fn close(&self) -> ModbusResult<()> {
        self.disconnect().await
    }

    async fn get_stats(&self) -> TransportStats {
        self.transport.lock().await.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{SimulatedBus, SlaveBehaviour};
    use crate::write_builder::{WriteDataItem, WriteFunction};

    async fn master() -> ModbusMaster<SimulatedBus> {
        let bus = SimulatedBus::new()
            .with_slave(1, SlaveBehaviour::Respond)
            .with_slave(2, SlaveBehaviour::Exception(0x02));
        let master = ModbusMaster::new(bus);
        assert!(master.connect(&ConnectionParams::default()).await.unwrap());
        master
    }

    #[tokio::test]
    async fn test_builder_write_then_typed_read() {
        let master = master().await;
        let mut builder = WriteRequestBuilder::new(WriteFunction::MultipleRegisters, 100);
        builder
            .push(WriteDataItem::new("3.5", DataType::Float32))
            .push(WriteDataItem::new("-7", DataType::Int16));
        assert_eq!(master.write(1, &builder).await.unwrap(), 3);

        let items = master
            .read_items(1, RegisterKind::HoldingRegisters, 100, 2, DataType::Float32)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].display(), "3.5");

        assert_eq!(master.read_03(1, 102, 1).await.unwrap(), vec![0xFFF9]);
    }

    #[tokio::test]
    async fn test_bad_item_sends_nothing() {
        let master = master().await;
        let mut builder = WriteRequestBuilder::new(WriteFunction::MultipleRegisters, 0);
        builder
            .push(WriteDataItem::new("3.14", DataType::Float32))
            .push(WriteDataItem::new("abc", DataType::UInt16));

        assert!(master.write(1, &builder).await.unwrap_err().is_format_error());
        assert_eq!(master.get_stats().await.requests_sent, 0);
    }

    /// Every reply claims to come from slave 9
    struct StrayReplies;

    #[async_trait]
    impl ModbusTransport for StrayReplies {
        async fn connect(&mut self, _params: &ConnectionParams) -> ModbusResult<bool> {
            Ok(true)
        }

        async fn disconnect(&mut self) -> ModbusResult<()> {
            Ok(())
        }

        async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
            Ok(ModbusResponse::new_success(9, request.function, Payload::Words(vec![0])))
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    #[tokio::test]
    async fn test_reply_from_another_slave_is_rejected() {
        let master = ModbusMaster::new(StrayReplies);
        let error = master.read_03(1, 0, 1).await.unwrap_err();
        assert!(matches!(error, ModbusError::Protocol { .. }));
        assert!(error.is_protocol_error());
        assert!(master.read_03(9, 0, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_exception_reply_is_an_error() {
        let master = master().await;
        let error = master.read_03(2, 0, 1).await.unwrap_err();
        assert!(matches!(error, ModbusError::Exception { code: 0x02, .. }));

        master.write_0f(1, 8, &[true, false, true]).await.unwrap();
        assert_eq!(master.read_01(1, 8, 3).await.unwrap(), vec![true, false, true]);
        assert!(master.read_01(1, 0, 0).await.is_err());
    }
}
