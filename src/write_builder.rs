/// Outgoing write payload assembly
///
/// Turns the operator's write batch (a list of typed text items) into the
/// boolean or word sequence that goes on the wire. A batch is all or nothing:
/// the first item that fails to parse aborts the build and no words are
/// produced for the items before it.

use serde::{Deserialize, Serialize};

use crate::codec::{self, DataType, WordOrder};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, Payload, SlaveId};
use crate::utils::validation;

/// The four Modbus write functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteFunction {
    SingleCoil,
    SingleRegister,
    MultipleCoils,
    MultipleRegisters,
}

impl WriteFunction {
    pub fn function_code(self) -> ModbusFunction {
        match self {
            WriteFunction::SingleCoil => ModbusFunction::WriteSingleCoil,
            WriteFunction::SingleRegister => ModbusFunction::WriteSingleRegister,
            WriteFunction::MultipleCoils => ModbusFunction::WriteMultipleCoils,
            WriteFunction::MultipleRegisters => ModbusFunction::WriteMultipleRegisters,
        }
    }

    pub fn from_function(function: ModbusFunction) -> ModbusResult<Self> {
        match function {
            ModbusFunction::WriteSingleCoil => Ok(WriteFunction::SingleCoil),
            ModbusFunction::WriteSingleRegister => Ok(WriteFunction::SingleRegister),
            ModbusFunction::WriteMultipleCoils => Ok(WriteFunction::MultipleCoils),
            ModbusFunction::WriteMultipleRegisters => Ok(WriteFunction::MultipleRegisters),
            other => Err(ModbusError::invalid_function(other.to_u8())),
        }
    }

    pub fn is_coil(self) -> bool {
        matches!(self, WriteFunction::SingleCoil | WriteFunction::MultipleCoils)
    }

    pub fn is_single(self) -> bool {
        matches!(self, WriteFunction::SingleCoil | WriteFunction::SingleRegister)
    }
}

/// One row of a write batch
#[derive(Debug, Clone, PartialEq)]
pub struct WriteDataItem {
    /// Position within the batch
    pub index: usize,
    /// Start address plus the spans of the preceding items
    pub address: u16,
    pub text: String,
    /// Used instead of `text` by coil functions
    pub bool_value: bool,
    pub data_type: DataType,
}

impl WriteDataItem {
    pub fn new<S: Into<String>>(text: S, data_type: DataType) -> Self {
        Self {
            index: 0,
            address: 0,
            text: text.into(),
            bool_value: false,
            data_type,
        }
    }

    pub fn coil(value: bool) -> Self {
        Self {
            bool_value: value,
            ..Self::new(String::new(), DataType::Binary)
        }
    }

    pub fn word_span(&self) -> usize {
        self.data_type.word_span_for(&self.text)
    }
}

/// Assign indices and addresses to a batch
///
/// Register batches advance by each item's word span, coil batches by one.
pub fn layout_items(start_address: u16, items: &mut [WriteDataItem], coils: bool) {
    let mut address = start_address;
    for (index, item) in items.iter_mut().enumerate() {
        item.index = index;
        item.address = address;
        let step = if coils { 1 } else { item.word_span().max(1) };
        address = address.wrapping_add(step as u16);
    }
}

/// Payload produced by a successful build
#[derive(Debug, Clone, PartialEq)]
pub enum WritePayload {
    Coils(Vec<bool>),
    Registers(Vec<u16>),
}

impl WritePayload {
    pub fn quantity(&self) -> usize {
        match self {
            WritePayload::Coils(bits) => bits.len(),
            WritePayload::Registers(words) => words.len(),
        }
    }
}

impl From<WritePayload> for Payload {
    fn from(payload: WritePayload) -> Self {
        match payload {
            WritePayload::Coils(bits) => Payload::Bits(bits),
            WritePayload::Registers(words) => Payload::Words(words),
        }
    }
}

/// Build the payload for `function` from `items`
///
/// Coil functions take each item's boolean value and ignore its text. Register
/// functions concatenate the encoded words of every item in order. Single
/// functions only look at the first item.
///
/// # Errors
///
/// - `ModbusError::Format` naming the item index and data type of the first
///   item that does not encode; nothing is returned for earlier items
/// - `ModbusError::InvalidData` for an empty batch
pub fn build_payload(function: WriteFunction, items: &[WriteDataItem], order: WordOrder) -> ModbusResult<WritePayload> {
    if items.is_empty() {
        return Err(ModbusError::invalid_data("write batch is empty"));
    }
    let items = if function.is_single() { &items[..1] } else { items };

    if function.is_coil() {
        return Ok(WritePayload::Coils(items.iter().map(|item| item.bool_value).collect()));
    }

    let mut words = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let encoded =
            codec::encode(&item.text, item.data_type, order).map_err(|err| err.with_item_index(index))?;
        if encoded.is_empty() {
            return Err(ModbusError::format(item.data_type, item.text.clone(), "value encodes to no words")
                .with_item_index(index));
        }
        words.extend(encoded);
    }

    if function.is_single() && words.len() != 1 {
        let item = &items[0];
        return Err(ModbusError::format(
            item.data_type,
            item.text.clone(),
            format!("a single register write takes one word, {} needs {}", item.data_type, words.len()),
        )
        .with_item_index(0));
    }

    Ok(WritePayload::Registers(words))
}

/// Write batch under construction
///
/// ```rust
/// use voltage_modbus_workbench::codec::DataType;
/// use voltage_modbus_workbench::write_builder::{WriteDataItem, WriteFunction, WriteRequestBuilder};
///
/// let mut builder = WriteRequestBuilder::new(WriteFunction::MultipleRegisters, 100);
/// builder.push(WriteDataItem::new("3.14", DataType::Float32));
/// builder.push(WriteDataItem::new("7", DataType::UInt16));
/// assert_eq!(builder.items()[1].address, 102);
///
/// let request = builder.build_request(1)?;
/// assert_eq!(request.quantity, 3);
/// # Ok::<(), voltage_modbus_workbench::ModbusError>(())
/// ```
#[derive(Debug, Clone)]
pub struct WriteRequestBuilder {
    function: WriteFunction,
    start_address: u16,
    word_order: WordOrder,
    items: Vec<WriteDataItem>,
}

impl WriteRequestBuilder {
    pub fn new(function: WriteFunction, start_address: u16) -> Self {
        Self {
            function,
            start_address,
            word_order: WordOrder::default(),
            items: Vec::new(),
        }
    }

    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    pub fn function(&self) -> WriteFunction {
        self.function
    }

    /// Switching function starts a fresh batch
    pub fn set_function(&mut self, function: WriteFunction) {
        if function != self.function {
            self.function = function;
            self.items.clear();
        }
    }

    pub fn set_start_address(&mut self, start_address: u16) {
        self.start_address = start_address;
        self.relayout();
    }

    pub fn items(&self) -> &[WriteDataItem] {
        &self.items
    }

    pub fn push(&mut self, item: WriteDataItem) -> &mut Self {
        self.items.push(item);
        self.relayout();
        self
    }

    /// Edit one item's text and type; later addresses follow the new span
    pub fn update_item(&mut self, index: usize, text: &str, data_type: DataType) -> ModbusResult<()> {
        let item = self
            .items
            .get_mut(index)
            .ok_or_else(|| ModbusError::invalid_data(format!("no write item {}", index)))?;
        item.text = text.to_string();
        item.data_type = data_type;
        self.relayout();
        Ok(())
    }

    pub fn remove_item(&mut self, index: usize) -> Option<WriteDataItem> {
        if index >= self.items.len() {
            return None;
        }
        let removed = self.items.remove(index);
        self.relayout();
        Some(removed)
    }

    pub fn build(&self) -> ModbusResult<WritePayload> {
        build_payload(self.function, &self.items, self.word_order)
    }

    /// Build and wrap the payload into a validated request
    pub fn build_request(&self, slave_id: SlaveId) -> ModbusResult<ModbusRequest> {
        let payload = self.build()?;
        validation::validate_address_range(self.start_address, payload.quantity() as u16)?;
        let request = ModbusRequest::new_write(slave_id, self.function.function_code(), self.start_address, payload.into());
        request.validate()?;
        Ok(request)
    }

    fn relayout(&mut self) {
        layout_items(self.start_address, &mut self.items, self.function.is_coil());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_item_aborts_whole_batch() {
        let items = vec![
            WriteDataItem::new("3.14", DataType::Float32),
            WriteDataItem::new("abc", DataType::UInt16),
        ];
        let err = build_payload(WriteFunction::MultipleRegisters, &items, WordOrder::default()).unwrap_err();
        match err {
            ModbusError::Format { index, data_type, input, .. } => {
                assert_eq!(index, Some(1));
                assert_eq!(data_type, DataType::UInt16);
                assert_eq!(input, "abc");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_register_batch_concatenates_items() {
        let items = vec![
            WriteDataItem::new("65538", DataType::UInt32),
            WriteDataItem::new("-1", DataType::Int16),
            WriteDataItem::new("OK", DataType::AsciiString),
        ];
        let payload = build_payload(WriteFunction::MultipleRegisters, &items, WordOrder::default()).unwrap();
        assert_eq!(payload, WritePayload::Registers(vec![0x0002, 0x0001, 0xFFFF, 0x4F4B]));

        let payload = build_payload(WriteFunction::MultipleRegisters, &items, WordOrder::HighWordFirst).unwrap();
        assert_eq!(payload, WritePayload::Registers(vec![0x0001, 0x0002, 0xFFFF, 0x4B4F]));
    }

    #[test]
    fn test_coil_batch_ignores_text() {
        let mut first = WriteDataItem::coil(true);
        first.text = "not a number".to_string();
        let items = vec![first, WriteDataItem::coil(false), WriteDataItem::coil(true)];
        let payload = build_payload(WriteFunction::MultipleCoils, &items, WordOrder::default()).unwrap();
        assert_eq!(payload, WritePayload::Coils(vec![true, false, true]));

        let payload = build_payload(WriteFunction::SingleCoil, &items, WordOrder::default()).unwrap();
        assert_eq!(payload, WritePayload::Coils(vec![true]));
    }

    #[test]
    fn test_single_register_uses_first_item() {
        let items = vec![
            WriteDataItem::new("0x00FF", DataType::Hex),
            WriteDataItem::new("garbage", DataType::UInt16),
        ];
        let payload = build_payload(WriteFunction::SingleRegister, &items, WordOrder::default()).unwrap();
        assert_eq!(payload, WritePayload::Registers(vec![0x00FF]));

        let wide = vec![WriteDataItem::new("1.5", DataType::Float32)];
        let err = build_payload(WriteFunction::SingleRegister, &wide, WordOrder::default()).unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let err = build_payload(WriteFunction::MultipleRegisters, &[], WordOrder::default()).unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
    }

    #[test]
    fn test_addresses_follow_spans() {
        let mut builder = WriteRequestBuilder::new(WriteFunction::MultipleRegisters, 10);
        builder
            .push(WriteDataItem::new("1", DataType::UInt16))
            .push(WriteDataItem::new("2", DataType::Float64))
            .push(WriteDataItem::new("HELLO", DataType::AsciiString))
            .push(WriteDataItem::new("3", DataType::Int32));
        let addresses: Vec<u16> = builder.items().iter().map(|item| item.address).collect();
        assert_eq!(addresses, vec![10, 11, 15, 18]);

        builder.update_item(1, "2", DataType::UInt16).unwrap();
        let addresses: Vec<u16> = builder.items().iter().map(|item| item.address).collect();
        assert_eq!(addresses, vec![10, 11, 12, 15]);

        builder.set_start_address(0);
        assert_eq!(builder.items()[3].address, 5);
        assert_eq!(builder.items()[3].index, 3);
    }

    #[test]
    fn test_build_request() {
        let mut builder = WriteRequestBuilder::new(WriteFunction::MultipleCoils, 8);
        builder.push(WriteDataItem::coil(true)).push(WriteDataItem::coil(true));
        let request = builder.build_request(5).unwrap();
        assert_eq!(request.function, ModbusFunction::WriteMultipleCoils);
        assert_eq!(request.quantity, 2);
        assert_eq!(request.payload, Payload::Bits(vec![true, true]));

        builder.set_function(WriteFunction::SingleRegister);
        assert!(builder.items().is_empty());
    }
}
