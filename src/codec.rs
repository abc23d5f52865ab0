//! # Register Type Codec
//!
//! Pure conversion between typed operator values and 16-bit register words.
//!
//! ## Word Layout
//!
//! The two bytes inside each word are packed little-endian. Values wider than one
//! word are laid out least-significant word first unless [`WordOrder::HighWordFirst`]
//! is selected, in which case the word sequence is reversed before it is
//! reinterpreted. The same rule covers `UInt32`, `Int32`, `Float32` and `Float64`.
//!
//! ASCII strings carry two characters per word. By default the earlier character
//! sits in the high byte; the reversed order swaps the bytes inside every word.
//! Odd-length strings are padded with a NUL on encode, trailing NULs are stripped
//! on decode.
//!
//! ```rust
//! use voltage_modbus_workbench::codec::{self, DataType, RegisterValue, WordOrder};
//!
//! let words = codec::encode("65538", DataType::UInt32, WordOrder::LowWordFirst)?;
//! assert_eq!(words, vec![0x0002, 0x0001]);
//!
//! let decoded = codec::decode(&words, DataType::UInt32, WordOrder::LowWordFirst).unwrap();
//! assert_eq!(decoded.value, RegisterValue::UInt32(65538));
//! assert_eq!(decoded.consumed, 2);
//! # Ok::<(), voltage_modbus_workbench::ModbusError>(())
//! ```

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// Logical type of a register entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
    AsciiString,
    Hex,
    Binary,
}

impl DataType {
    /// Every supported type, in menu order
    pub const ALL: [DataType; 9] = [
        DataType::UInt16,
        DataType::Int16,
        DataType::UInt32,
        DataType::Int32,
        DataType::Float32,
        DataType::Float64,
        DataType::AsciiString,
        DataType::Hex,
        DataType::Binary,
    ];

    /// Number of words a value of this type occupies
    ///
    /// `None` for `AsciiString`, whose span depends on the text length.
    pub fn fixed_span(self) -> Option<usize> {
        match self {
            DataType::UInt16 | DataType::Int16 | DataType::Hex | DataType::Binary => Some(1),
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => Some(2),
            DataType::Float64 => Some(4),
            DataType::AsciiString => None,
        }
    }

    /// Word span of `text` once encoded as this type
    pub fn word_span_for(self, text: &str) -> usize {
        self.fixed_span().unwrap_or_else(|| ascii_span(text.len()))
    }

    /// Types whose value is assembled from more than one word
    pub fn is_multi_word(self) -> bool {
        matches!(
            self,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 | DataType::Float64 | DataType::AsciiString
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::UInt16 => "UInt16",
            DataType::Int16 => "Int16",
            DataType::UInt32 => "UInt32",
            DataType::Int32 => "Int32",
            DataType::Float32 => "Float32",
            DataType::Float64 => "Float64",
            DataType::AsciiString => "AsciiString",
            DataType::Hex => "Hex",
            DataType::Binary => "Binary",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Words needed for an ASCII string of `len` characters
pub fn ascii_span(len: usize) -> usize {
    (len + 1) / 2
}

/// Order in which multi-word values are laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WordOrder {
    /// Least-significant word first
    #[default]
    LowWordFirst,
    /// Most-significant word first ("reverse register order")
    HighWordFirst,
}

impl WordOrder {
    /// Map the operator's "reverse register order" toggle onto a word order
    pub fn from_reverse(reverse: bool) -> Self {
        if reverse {
            WordOrder::HighWordFirst
        } else {
            WordOrder::LowWordFirst
        }
    }

    pub fn is_reversed(self) -> bool {
        self == WordOrder::HighWordFirst
    }

    pub fn opposite(self) -> Self {
        Self::from_reverse(!self.is_reversed())
    }
}

/// A decoded register value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegisterValue {
    UInt16(u16),
    Int16(i16),
    UInt32(u32),
    Int32(i32),
    Float32(f32),
    Float64(f64),
    Ascii(String),
    Hex(u16),
    Binary(u16),
}

impl RegisterValue {
    /// Parse operator text as a value of `data_type`
    ///
    /// # Errors
    ///
    /// `ModbusError::Format` when the text is not a valid literal for the type.
    pub fn parse(text: &str, data_type: DataType) -> ModbusResult<Self> {
        let trimmed = text.trim();
        let fail = |reason: String| ModbusError::format(data_type, text, reason);

        let value = match data_type {
            DataType::UInt16 => RegisterValue::UInt16(trimmed.parse().map_err(|e| fail(format!("{}", e)))?),
            DataType::Int16 => RegisterValue::Int16(trimmed.parse().map_err(|e| fail(format!("{}", e)))?),
            DataType::UInt32 => RegisterValue::UInt32(trimmed.parse().map_err(|e| fail(format!("{}", e)))?),
            DataType::Int32 => RegisterValue::Int32(trimmed.parse().map_err(|e| fail(format!("{}", e)))?),
            DataType::Float32 => RegisterValue::Float32(trimmed.parse().map_err(|e| fail(format!("{}", e)))?),
            DataType::Float64 => RegisterValue::Float64(trimmed.parse().map_err(|e| fail(format!("{}", e)))?),
            DataType::AsciiString => {
                // Leading/trailing spaces are part of an ASCII value
                if !text.is_ascii() {
                    return Err(fail("only ASCII characters can be stored".to_string()));
                }
                RegisterValue::Ascii(text.to_string())
            }
            DataType::Hex => RegisterValue::Hex(parse_hex_word(trimmed).map_err(fail)?),
            DataType::Binary => RegisterValue::Binary(parse_binary_word(trimmed).map_err(fail)?),
        };
        Ok(value)
    }

    pub fn data_type(&self) -> DataType {
        match self {
            RegisterValue::UInt16(_) => DataType::UInt16,
            RegisterValue::Int16(_) => DataType::Int16,
            RegisterValue::UInt32(_) => DataType::UInt32,
            RegisterValue::Int32(_) => DataType::Int32,
            RegisterValue::Float32(_) => DataType::Float32,
            RegisterValue::Float64(_) => DataType::Float64,
            RegisterValue::Ascii(_) => DataType::AsciiString,
            RegisterValue::Hex(_) => DataType::Hex,
            RegisterValue::Binary(_) => DataType::Binary,
        }
    }

    /// Lay the value out as register words
    pub fn to_words(&self, order: WordOrder) -> Vec<u16> {
        match self {
            RegisterValue::UInt16(v) | RegisterValue::Hex(v) | RegisterValue::Binary(v) => vec![*v],
            RegisterValue::Int16(v) => vec![*v as u16],
            RegisterValue::UInt32(v) => {
                let mut buf = [0u8; 4];
                LittleEndian::write_u32(&mut buf, *v);
                bytes_to_words(&buf, order)
            }
            RegisterValue::Int32(v) => {
                let mut buf = [0u8; 4];
                LittleEndian::write_i32(&mut buf, *v);
                bytes_to_words(&buf, order)
            }
            RegisterValue::Float32(v) => {
                let mut buf = [0u8; 4];
                LittleEndian::write_f32(&mut buf, *v);
                bytes_to_words(&buf, order)
            }
            RegisterValue::Float64(v) => {
                let mut buf = [0u8; 8];
                LittleEndian::write_f64(&mut buf, *v);
                bytes_to_words(&buf, order)
            }
            RegisterValue::Ascii(text) => ascii_to_words(text.as_bytes(), order),
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::UInt16(v) => write!(f, "{}", v),
            RegisterValue::Int16(v) => write!(f, "{}", v),
            RegisterValue::UInt32(v) => write!(f, "{}", v),
            RegisterValue::Int32(v) => write!(f, "{}", v),
            RegisterValue::Float32(v) => write!(f, "{}", v),
            RegisterValue::Float64(v) => write!(f, "{}", v),
            RegisterValue::Ascii(text) => f.write_str(text),
            RegisterValue::Hex(v) => write!(f, "0x{:04X}", v),
            RegisterValue::Binary(v) => write!(f, "{:016b}", v),
        }
    }
}

/// Result of decoding one value from a word slice
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub value: RegisterValue,
    /// Words taken from the front of the input
    pub consumed: usize,
}

/// Encode operator text as register words
///
/// # Errors
///
/// `ModbusError::Format` if `text` does not parse as `data_type`.
pub fn encode(text: &str, data_type: DataType, order: WordOrder) -> ModbusResult<Vec<u16>> {
    Ok(RegisterValue::parse(text, data_type)?.to_words(order))
}

/// Decode one value of `data_type` from the front of `words`
///
/// Returns `None` when fewer words remain than the type needs; running off the
/// end of a payload is not an error. `AsciiString` consumes the whole slice.
pub fn decode(words: &[u16], data_type: DataType, order: WordOrder) -> Option<Decoded> {
    let span = match data_type.fixed_span() {
        Some(span) => span,
        None if words.is_empty() => return None,
        None => words.len(),
    };
    if words.len() < span {
        return None;
    }

    let words = &words[..span];
    let value = match data_type {
        DataType::UInt16 => RegisterValue::UInt16(words[0]),
        DataType::Int16 => RegisterValue::Int16(words[0] as i16),
        DataType::Hex => RegisterValue::Hex(words[0]),
        DataType::Binary => RegisterValue::Binary(words[0]),
        DataType::UInt32 => RegisterValue::UInt32(LittleEndian::read_u32(&words_to_bytes(words, order))),
        DataType::Int32 => RegisterValue::Int32(LittleEndian::read_i32(&words_to_bytes(words, order))),
        DataType::Float32 => RegisterValue::Float32(LittleEndian::read_f32(&words_to_bytes(words, order))),
        DataType::Float64 => RegisterValue::Float64(LittleEndian::read_f64(&words_to_bytes(words, order))),
        DataType::AsciiString => RegisterValue::Ascii(words_to_ascii(words, order)),
    };

    Some(Decoded { value, consumed: span })
}

/// Render `words` the way the operator sees a value of `data_type`
///
/// Used for display projections; a short slice renders as an empty string.
pub fn display(words: &[u16], data_type: DataType, order: WordOrder) -> String {
    decode(words, data_type, order)
        .map(|decoded| decoded.value.to_string())
        .unwrap_or_default()
}

fn bytes_to_words(bytes: &[u8], order: WordOrder) -> Vec<u16> {
    let mut words: Vec<u16> = bytes.chunks_exact(2).map(LittleEndian::read_u16).collect();
    if order.is_reversed() {
        words.reverse();
    }
    words
}

fn words_to_bytes(words: &[u16], order: WordOrder) -> Vec<u8> {
    let mut ordered = words.to_vec();
    if order.is_reversed() {
        ordered.reverse();
    }
    let mut bytes = vec![0u8; ordered.len() * 2];
    LittleEndian::write_u16_into(&ordered, &mut bytes);
    bytes
}

fn ascii_to_words(bytes: &[u8], order: WordOrder) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| {
            let first = pair[0] as u16;
            let second = pair.get(1).copied().unwrap_or(0) as u16;
            if order.is_reversed() {
                (second << 8) | first
            } else {
                (first << 8) | second
            }
        })
        .collect()
}

fn words_to_ascii(words: &[u16], order: WordOrder) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for &word in words {
        let [high, low] = word.to_be_bytes();
        if order.is_reversed() {
            bytes.extend_from_slice(&[low, high]);
        } else {
            bytes.extend_from_slice(&[high, low]);
        }
    }
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes.into_iter().map(char::from).collect()
}

fn parse_hex_word(text: &str) -> Result<u16, String> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() || digits.len() > 4 {
        return Err(format!("expected 1-4 hex digits, got {}", digits.len()));
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("non-hex digit".to_string());
    }
    u16::from_str_radix(digits, 16).map_err(|e| e.to_string())
}

fn parse_binary_word(text: &str) -> Result<u16, String> {
    let body = text
        .strip_prefix("0b")
        .or_else(|| text.strip_prefix("0B"))
        .unwrap_or(text);
    let digits: String = body.chars().filter(|c| *c != '_' && *c != ' ').collect();
    if digits.is_empty() || digits.len() > 16 {
        return Err(format!("expected 1-16 binary digits, got {}", digits.len()));
    }
    if !digits.chars().all(|c| c == '0' || c == '1') {
        return Err("non-binary digit".to_string());
    }
    u16::from_str_radix(&digits, 2).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const ORDERS: [WordOrder; 2] = [WordOrder::LowWordFirst, WordOrder::HighWordFirst];

    fn round_trip(value: RegisterValue, order: WordOrder) {
        let words = value.to_words(order);
        let decoded = decode(&words, value.data_type(), order).unwrap();
        assert_eq!(decoded.value, value, "order {:?}", order);
        assert_eq!(decoded.consumed, words.len());
    }

    #[test]
    fn test_word_spans() {
        assert_eq!(DataType::UInt16.fixed_span(), Some(1));
        assert_eq!(DataType::Hex.fixed_span(), Some(1));
        assert_eq!(DataType::Binary.fixed_span(), Some(1));
        assert_eq!(DataType::Float32.fixed_span(), Some(2));
        assert_eq!(DataType::Int32.fixed_span(), Some(2));
        assert_eq!(DataType::Float64.fixed_span(), Some(4));
        assert_eq!(DataType::AsciiString.fixed_span(), None);
        assert_eq!(DataType::AsciiString.word_span_for("HELLO"), 3);
        assert_eq!(DataType::AsciiString.word_span_for("ABCD"), 2);
    }

    #[test]
    fn test_default_layout_is_low_word_first() {
        let words = encode("65538", DataType::UInt32, WordOrder::LowWordFirst).unwrap();
        assert_eq!(words, vec![0x0002, 0x0001]);

        let words = encode("65538", DataType::UInt32, WordOrder::HighWordFirst).unwrap();
        assert_eq!(words, vec![0x0001, 0x0002]);

        // 1.0f32 = 0x3F80_0000
        let words = encode("1", DataType::Float32, WordOrder::LowWordFirst).unwrap();
        assert_eq!(words, vec![0x0000, 0x3F80]);
    }

    #[test]
    fn test_round_trip_random_values() {
        let mut rng = rand::thread_rng();
        for order in ORDERS {
            for _ in 0..200 {
                round_trip(RegisterValue::UInt16(rng.gen()), order);
                round_trip(RegisterValue::Int16(rng.gen()), order);
                round_trip(RegisterValue::UInt32(rng.gen()), order);
                round_trip(RegisterValue::Int32(rng.gen()), order);
                round_trip(RegisterValue::Float32(rng.gen_range(-1.0e6f32..1.0e6)), order);
                round_trip(RegisterValue::Float64(rng.gen_range(-1.0e12f64..1.0e12)), order);
                round_trip(RegisterValue::Hex(rng.gen()), order);
                round_trip(RegisterValue::Binary(rng.gen()), order);
            }
        }
    }

    #[test]
    fn test_ascii_round_trip_drops_padding_only() {
        for order in ORDERS {
            round_trip(RegisterValue::Ascii("ABCD".to_string()), order);

            let words = encode("HELLO", DataType::AsciiString, order).unwrap();
            assert_eq!(words.len(), 3);
            let decoded = decode(&words, DataType::AsciiString, order).unwrap();
            assert_eq!(decoded.value, RegisterValue::Ascii("HELLO".to_string()));
            assert_eq!(decoded.consumed, 3);
        }
    }

    #[test]
    fn test_ascii_byte_order() {
        let words = encode("AB", DataType::AsciiString, WordOrder::LowWordFirst).unwrap();
        assert_eq!(words, vec![0x4142]);
        let words = encode("AB", DataType::AsciiString, WordOrder::HighWordFirst).unwrap();
        assert_eq!(words, vec![0x4241]);
        let words = encode("A", DataType::AsciiString, WordOrder::LowWordFirst).unwrap();
        assert_eq!(words, vec![0x4100]);
    }

    #[test]
    fn test_opposite_order_changes_multi_word_values() {
        let samples = [
            RegisterValue::UInt32(0x0001_0002),
            RegisterValue::Int32(-123_456),
            RegisterValue::Float32(3.14),
            RegisterValue::Float64(2.718281828459045),
        ];
        for value in samples {
            for order in ORDERS {
                let words = value.to_words(order);
                let wrong = decode(&words, value.data_type(), order.opposite()).unwrap();
                assert_ne!(wrong.value, value);
            }
        }
    }

    #[test]
    fn test_short_payload_decodes_nothing() {
        assert!(decode(&[0x1234], DataType::Float32, WordOrder::LowWordFirst).is_none());
        assert!(decode(&[1, 2, 3], DataType::Float64, WordOrder::LowWordFirst).is_none());
        assert!(decode(&[], DataType::AsciiString, WordOrder::LowWordFirst).is_none());
        assert!(decode(&[], DataType::UInt16, WordOrder::LowWordFirst).is_none());
    }

    #[test]
    fn test_hex_and_binary_text() {
        assert_eq!(encode("0x1A2b", DataType::Hex, WordOrder::LowWordFirst).unwrap(), vec![0x1A2B]);
        assert_eq!(encode("ff", DataType::Hex, WordOrder::LowWordFirst).unwrap(), vec![0x00FF]);
        assert!(encode("0xG1", DataType::Hex, WordOrder::LowWordFirst).is_err());
        assert!(encode("12345", DataType::Hex, WordOrder::LowWordFirst).is_err());

        assert_eq!(encode("0b1010", DataType::Binary, WordOrder::LowWordFirst).unwrap(), vec![0b1010]);
        assert_eq!(
            encode("1111_0000 1111_0000", DataType::Binary, WordOrder::LowWordFirst).unwrap(),
            vec![0xF0F0]
        );
        assert!(encode("10201", DataType::Binary, WordOrder::LowWordFirst).is_err());
        assert!(encode("11111111111111111", DataType::Binary, WordOrder::LowWordFirst).is_err());

        assert_eq!(display(&[0x00AB], DataType::Hex, WordOrder::LowWordFirst), "0x00AB");
        assert_eq!(display(&[5], DataType::Binary, WordOrder::LowWordFirst), "0000000000000101");
    }

    #[test]
    fn test_format_errors_name_the_type() {
        let err = encode("abc", DataType::UInt16, WordOrder::LowWordFirst).unwrap_err();
        match err {
            ModbusError::Format { data_type, input, index, .. } => {
                assert_eq!(data_type, DataType::UInt16);
                assert_eq!(input, "abc");
                assert_eq!(index, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(encode("70000", DataType::UInt16, WordOrder::LowWordFirst).is_err());
        assert!(encode("-1", DataType::UInt32, WordOrder::LowWordFirst).is_err());
        assert!(encode("température", DataType::AsciiString, WordOrder::LowWordFirst).is_err());
    }

    #[test]
    fn test_signed_display() {
        let words = encode("-2", DataType::Int16, WordOrder::LowWordFirst).unwrap();
        assert_eq!(words, vec![0xFFFE]);
        assert_eq!(display(&words, DataType::Int16, WordOrder::LowWordFirst), "-2");
        assert_eq!(display(&words, DataType::UInt16, WordOrder::LowWordFirst), "65534");
    }
}
