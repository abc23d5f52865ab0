/// Inbound payload decoding
///
/// Converts the raw words or bits of a read reply into addressed display items.
/// Items are rebuilt from scratch on every response.

use std::fmt;

use log::debug;

use crate::codec::{self, DataType, RegisterValue, WordOrder};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusResponse, Payload};
use crate::utils::format;

/// Value shown for one response item
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Register(RegisterValue),
    Bit(bool),
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Register(value) => value.fmt(f),
            DecodedValue::Bit(bit) => f.write_str(if *bit { "1" } else { "0" }),
        }
    }
}

/// One addressed, typed value of a response
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponseItem {
    pub address: u16,
    pub value: DecodedValue,
    pub data_type: DataType,
    /// Words the value was decoded from; a bit item carries 0 or 1
    pub raw: Vec<u16>,
}

impl ModbusResponseItem {
    pub fn display(&self) -> String {
        self.value.to_string()
    }

    pub fn raw_hex(&self) -> String {
        format::registers_to_hex(&self.raw)
    }

    /// Byte dump of the raw words, low byte of each word first
    pub fn raw_bytes_hex(&self) -> String {
        format::words_to_byte_hex(&self.raw)
    }
}

/// Decode a word payload into items of `data_type`
///
/// The address advances by the words each value consumed. Trailing words too
/// few for another value are dropped. `AsciiString` turns the whole payload
/// into a single item.
pub fn decode_words(words: &[u16], data_type: DataType, order: WordOrder, start_address: u16) -> Vec<ModbusResponseItem> {
    let mut items = Vec::new();
    let mut offset = 0;
    let mut address = start_address;

    while offset < words.len() {
        let Some(decoded) = codec::decode(&words[offset..], data_type, order) else {
            debug!(
                "Dropping {} trailing words, {} needs {:?}",
                words.len() - offset,
                data_type,
                data_type.fixed_span()
            );
            break;
        };
        items.push(ModbusResponseItem {
            address,
            value: DecodedValue::Register(decoded.value),
            data_type,
            raw: words[offset..offset + decoded.consumed].to_vec(),
        });
        offset += decoded.consumed;
        address = address.wrapping_add(decoded.consumed as u16);
    }

    items
}

/// Decode a bit payload, one `Binary` item per bit
pub fn decode_bits(bits: &[bool], start_address: u16) -> Vec<ModbusResponseItem> {
    bits.iter()
        .enumerate()
        .map(|(i, &bit)| ModbusResponseItem {
            address: start_address.wrapping_add(i as u16),
            value: DecodedValue::Bit(bit),
            data_type: DataType::Binary,
            raw: vec![bit as u16],
        })
        .collect()
}

/// Decoder settings chosen by the operator for a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseDecoder {
    pub data_type: DataType,
    pub word_order: WordOrder,
}

impl ResponseDecoder {
    pub fn new(data_type: DataType, word_order: WordOrder) -> Self {
        Self { data_type, word_order }
    }

    /// Decode a reply to a read that started at `start_address`
    ///
    /// # Errors
    ///
    /// `ModbusError::Exception` if the device answered with an exception code.
    pub fn decode(&self, response: &ModbusResponse, start_address: u16) -> ModbusResult<Vec<ModbusResponseItem>> {
        if let Some(code) = response.exception_code {
            return Err(ModbusError::exception(response.function.to_u8(), code));
        }
        let items = match &response.payload {
            Payload::Words(words) => decode_words(words, self.data_type, self.word_order, start_address),
            Payload::Bits(bits) => decode_bits(bits, start_address),
            Payload::Empty => Vec::new(),
        };
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ModbusFunction;

    #[test]
    fn test_float_items_advance_by_span() {
        let mut words = codec::encode("1.5", DataType::Float32, WordOrder::default()).unwrap();
        words.extend(codec::encode("-2", DataType::Float32, WordOrder::default()).unwrap());
        words.push(0xBEEF);

        let items = decode_words(&words, DataType::Float32, WordOrder::default(), 100);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].address, 100);
        assert_eq!(items[0].display(), "1.5");
        assert_eq!(items[1].address, 102);
        assert_eq!(items[1].display(), "-2");
        assert_eq!(items[1].raw.len(), 2);
    }

    #[test]
    fn test_single_word_items() {
        let items = decode_words(&[1, 0xFFFF, 3], DataType::Int16, WordOrder::default(), 0);
        let shown: Vec<String> = items.iter().map(|item| item.display()).collect();
        assert_eq!(shown, vec!["1", "-1", "3"]);
        assert_eq!(items[2].address, 2);
    }

    #[test]
    fn test_ascii_is_one_item() {
        let words = codec::encode("PUMP-01", DataType::AsciiString, WordOrder::default()).unwrap();
        let items = decode_words(&words, DataType::AsciiString, WordOrder::default(), 40);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].display(), "PUMP-01");
        assert_eq!(items[0].address, 40);
        assert_eq!(items[0].raw.len(), 4);
        assert_eq!(items[0].raw_hex(), "5055 4D50 2D30 3100");
        assert_eq!(items[0].raw_bytes_hex(), "5550504D302D0031");
    }

    #[test]
    fn test_short_payload_yields_nothing() {
        assert!(decode_words(&[1, 2, 3], DataType::Float64, WordOrder::default(), 0).is_empty());
        assert!(decode_words(&[], DataType::AsciiString, WordOrder::default(), 0).is_empty());
    }

    #[test]
    fn test_bits() {
        let items = decode_bits(&[true, false, true], 7);
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.data_type == DataType::Binary));
        assert_eq!(items[2].address, 9);
        assert_eq!(items[0].display(), "1");
        assert_eq!(items[1].raw, vec![0]);
    }

    #[test]
    fn test_decoder_surfaces_exceptions() {
        let decoder = ResponseDecoder::new(DataType::UInt16, WordOrder::default());
        let response = ModbusResponse::new_exception(1, ModbusFunction::ReadHoldingRegisters, 0x02);
        assert!(matches!(
            decoder.decode(&response, 0),
            Err(ModbusError::Exception { code: 0x02, .. })
        ));

        let response = ModbusResponse::new_success(1, ModbusFunction::ReadCoils, Payload::Bits(vec![true]));
        assert_eq!(decoder.decode(&response, 5).unwrap().len(), 1);
    }
}
