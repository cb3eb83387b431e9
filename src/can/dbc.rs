//! DBC database wrapper and bit-exact frame decoder
//!
//! Parses a Vector DBC file through the `can-dbc` crate into an internal
//! message/signal model, then decodes raw frames into typed, quality-tagged
//! signal values. Invalid/not-available sentinel patterns and the
//! physical-range check are pre-computed once per signal at parse time and
//! reused on every decode.

use crate::error::{Result, VssDagError};
use crate::types::{EnumMap, SignalQuality, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Byte order for signal extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Intel format: start bit is the LSB
    LittleEndian,
    /// Motorola format: start bit is the MSB
    BigEndian,
}

/// One signal definition with its pre-computed validity patterns.
#[derive(Debug, Clone)]
pub struct SignalSpec {
    pub name: String,
    pub start_bit: usize,
    pub bit_size: usize,
    pub byte_order: ByteOrder,
    pub signed: bool,
    pub factor: f64,
    pub offset: f64,
    pub min: f64,
    pub max: f64,
    pub unit: Option<String>,
    pub has_enums: bool,

    /// All-ones raw pattern, the "invalid" sentinel
    invalid_raw: u64,
    /// All-ones-minus-one raw pattern, the "not available" sentinel
    na_raw: u64,
    /// The sentinel is usable iff its physical value lies outside the
    /// declared range
    use_invalid: bool,
    use_na: bool,
    /// False when the DBC declares no range (min == max == 0)
    range_declared: bool,
}

impl SignalSpec {
    fn physical_of_raw(&self, raw: u64) -> f64 {
        let signed_raw = if self.signed {
            sign_extend(raw, self.bit_size)
        } else {
            raw as i64
        };
        self.offset + self.factor * signed_raw as f64
    }

    /// Quality of one decoded sample. The checks run in sentinel order:
    /// invalid pattern, not-available pattern, then physical range.
    fn check_quality(&self, raw: u64, physical: f64) -> SignalQuality {
        if self.use_invalid && raw == self.invalid_raw {
            return SignalQuality::Invalid;
        }
        if self.use_na && raw == self.na_raw {
            return SignalQuality::NotAvailable;
        }
        if self.range_declared && (physical < self.min || physical > self.max) {
            return SignalQuality::Invalid;
        }
        SignalQuality::Valid
    }
}

/// One message definition.
#[derive(Debug, Clone)]
pub struct MessageSpec {
    pub id: u32,
    pub name: String,
    pub size: usize,
    pub transmitter: Option<String>,
    pub signals: Vec<SignalSpec>,
}

/// A decoded signal sample, still carrying the database-level signal name.
#[derive(Debug, Clone)]
pub struct DecodedSignal {
    pub name: String,
    pub value: Value,
    pub quality: SignalQuality,
    pub has_enums: bool,
}

/// Parsed DBC database with decode support.
#[derive(Debug, Default)]
pub struct DbcDatabase {
    messages: HashMap<u32, MessageSpec>,
    signal_message: HashMap<String, u32>,
    enums: HashMap<String, EnumMap>,
    no_enums: EnumMap,
}

/// Extended-frame flag and padding stripped: only the 29 identifier bits
/// take part in matching.
const CAN_ID_MASK: u32 = 0x1FFF_FFFF;

impl DbcDatabase {
    /// Parse a DBC file from disk. Non-UTF-8 files fall back to a Latin-1
    /// interpretation.
    pub fn from_file(path: &Path) -> Result<Self> {
        info!("parsing DBC file {}", path.display());
        let bytes = std::fs::read(path)
            .map_err(|e| VssDagError::Dbc(format!("failed to read {}: {}", path.display(), e)))?;
        let content = match String::from_utf8(bytes.clone()) {
            Ok(text) => text,
            Err(_) => {
                warn!("DBC file is not UTF-8, trying Latin-1");
                bytes.iter().map(|&b| b as char).collect()
            }
        };
        Self::from_dbc_content(&content)
    }

    /// Parse a DBC document from a string.
    pub fn from_dbc_content(content: &str) -> Result<Self> {
        let dbc = can_dbc::DBC::from_slice(content.as_bytes())
            .map_err(|e| VssDagError::Dbc(format!("failed to parse DBC: {:?}", e)))?;

        let mut db = DbcDatabase::default();

        // Value descriptions become bidirectional enum maps
        for desc in dbc.value_descriptions() {
            if let can_dbc::ValueDescription::Signal {
                signal_name,
                value_descriptions,
                ..
            } = desc
            {
                let map = db.enums.entry(signal_name.clone()).or_default();
                for entry in value_descriptions {
                    map.insert(entry.b().clone(), *entry.a() as i64);
                }
            }
        }

        for message in dbc.messages() {
            let id = message.message_id().0 & CAN_ID_MASK;
            let transmitter = match message.transmitter() {
                can_dbc::Transmitter::NodeName(name) => Some(name.clone()),
                _ => None,
            };

            let mut signals = Vec::with_capacity(message.signals().len());
            for signal in message.signals() {
                let spec = db.convert_signal(signal);
                db.signal_message.insert(spec.name.clone(), id);
                signals.push(spec);
            }

            db.messages.insert(
                id,
                MessageSpec {
                    id,
                    name: message.message_name().clone(),
                    size: *message.message_size() as usize,
                    transmitter,
                    signals,
                },
            );
        }

        info!(
            messages = db.messages.len(),
            enums = db.enums.len(),
            "parsed DBC database"
        );
        Ok(db)
    }

    fn convert_signal(&self, signal: &can_dbc::Signal) -> SignalSpec {
        let bit_size = *signal.signal_size() as usize;
        let invalid_raw = if bit_size >= 64 {
            u64::MAX
        } else {
            (1u64 << bit_size) - 1
        };
        let na_raw = invalid_raw.wrapping_sub(1);

        let mut spec = SignalSpec {
            name: signal.name().clone(),
            start_bit: *signal.start_bit() as usize,
            bit_size,
            byte_order: match signal.byte_order() {
                can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
                can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
            },
            signed: matches!(signal.value_type(), can_dbc::ValueType::Signed),
            factor: *signal.factor(),
            offset: *signal.offset(),
            min: *signal.min(),
            max: *signal.max(),
            unit: if signal.unit().is_empty() {
                None
            } else {
                Some(signal.unit().clone())
            },
            has_enums: self.enums.contains_key(signal.name()),
            invalid_raw,
            na_raw,
            use_invalid: false,
            use_na: false,
            range_declared: !(*signal.min() == 0.0 && *signal.max() == 0.0),
        };

        if spec.range_declared {
            let invalid_phys = spec.physical_of_raw(spec.invalid_raw);
            spec.use_invalid = invalid_phys < spec.min || invalid_phys > spec.max;
            let na_phys = spec.physical_of_raw(spec.na_raw);
            spec.use_na = na_phys < spec.min || na_phys > spec.max;
        }

        debug!(
            signal = %spec.name,
            invalid_usable = spec.use_invalid,
            na_usable = spec.use_na,
            "pre-computed validity patterns"
        );
        spec
    }

    pub fn has_message(&self, id: u32) -> bool {
        self.messages.contains_key(&(id & CAN_ID_MASK))
    }

    /// Database-level signal names present in a message, in declaration
    /// order.
    pub fn signals_of(&self, id: u32) -> Vec<&str> {
        self.messages
            .get(&(id & CAN_ID_MASK))
            .map(|m| m.signals.iter().map(|s| s.name.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn message_id_of(&self, signal_name: &str) -> Option<u32> {
        self.signal_message.get(signal_name).copied()
    }

    /// Enum labels for a signal; empty when the signal has none.
    pub fn enum_of(&self, signal_name: &str) -> &EnumMap {
        self.enums.get(signal_name).unwrap_or(&self.no_enums)
    }

    /// Decode a raw frame into quality-tagged signal samples.
    ///
    /// A frame whose masked id has no matching message yields an empty
    /// sequence. A signal that does not fit the frame is logged and
    /// omitted; the rest of the frame still decodes.
    pub fn decode(&self, id: u32, data: &[u8]) -> Vec<DecodedSignal> {
        let Some(message) = self.messages.get(&(id & CAN_ID_MASK)) else {
            return Vec::new();
        };

        let mut decoded = Vec::with_capacity(message.signals.len());
        for spec in &message.signals {
            let Some(raw) = extract_raw(data, spec) else {
                warn!(
                    signal = %spec.name,
                    frame_len = data.len(),
                    "signal does not fit frame, skipping"
                );
                continue;
            };

            let signed_raw = if spec.signed {
                sign_extend(raw, spec.bit_size)
            } else {
                raw as i64
            };
            let physical = spec.offset + spec.factor * signed_raw as f64;
            let quality = spec.check_quality(raw, physical);

            // Unit scaling forces a float; otherwise integral physical
            // values stay integers while they fit i64
            let value = if spec.factor != 1.0 || spec.offset != 0.0 {
                Value::Double(physical)
            } else if !spec.signed && spec.bit_size == 64 && raw > i64::MAX as u64 {
                Value::Double(raw as f64)
            } else {
                Value::Int64(signed_raw)
            };

            decoded.push(DecodedSignal {
                name: spec.name.clone(),
                value,
                quality,
                has_enums: spec.has_enums,
            });
        }
        decoded
    }
}

/// Extract the raw bit pattern of a signal from frame data.
fn extract_raw(data: &[u8], spec: &SignalSpec) -> Option<u64> {
    let required_bytes = (spec.start_bit + spec.bit_size + 7) / 8;
    if required_bytes > data.len() || spec.bit_size == 0 || spec.bit_size > 64 {
        return None;
    }
    Some(match spec.byte_order {
        ByteOrder::LittleEndian => extract_little_endian(data, spec.start_bit, spec.bit_size),
        ByteOrder::BigEndian => extract_big_endian(data, spec.start_bit, spec.bit_size),
    })
}

/// Intel layout: the start bit is the LSB, bits are numbered LSB-first
/// within each byte.
fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;
    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = bit_pos % 8;
        if byte_idx < data.len() {
            let bit = (data[byte_idx] >> bit_in_byte) & 0x01;
            result |= (bit as u64) << i;
        }
    }
    result
}

/// Motorola layout: the start bit is the MSB of the signal, bit 0 is the
/// MSB of byte 0, and the signal grows toward higher bit numbers.
fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;
    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = 7 - (bit_pos % 8);
        if byte_idx < data.len() {
            let bit = (data[byte_idx] >> bit_in_byte) & 0x01;
            result |= (bit as u64) << (length - 1 - i);
        }
    }
    result
}

/// Sign-extend an N-bit value to 64 bits.
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }
    let sign_bit = 1u64 << (bit_length - 1);
    if value & sign_bit != 0 {
        (value | (!0u64 << bit_length)) as i64
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DBC: &str = r#"
VERSION ""

NS_ :
    NS_DESC_
    CM_
    BA_DEF_
    BA_
    VAL_
    CAT_DEF_
    CAT_
    FILTER
    BA_DEF_DEF_
    EV_DATA_
    ENVVAR_DATA_
    SGTYPE_
    SGTYPE_VAL_
    BA_DEF_SGTYPE_
    BA_SGTYPE_
    SIG_TYPE_REF_
    VAL_TABLE_
    SIG_GROUP_
    SIG_VALTYPE_
    SIGTYPE_VALTYPE_
    BO_TX_BU_
    BA_DEF_REL_
    BA_REL_
    BA_SGTYPE_REL_
    SG_MUL_VAL_

BS_:

BU_: ECU1 ECU2

BO_ 291 StatusData: 8 ECU1
 SG_ ErrorCode : 0|8@1+ (1,0) [0|253] "" ECU2
 SG_ FullRange : 8|8@1+ (1,0) [0|255] "" ECU2
 SG_ GearPos : 16|3@1+ (1,0) [0|5] "" ECU2
 SG_ Temperature : 24|8@1+ (1,-40) [-40|100] "C" ECU2

BO_ 512 MotionData: 8 ECU1
 SG_ VehSpd : 0|16@1+ (0.01,0) [0|655.35] "km/h" ECU2
 SG_ LateralAccel : 16|8@1- (0.1,0) [-12.8|12.7] "m/s2" ECU2

VAL_ 291 GearPos 0 "PARK" 1 "REVERSE" 2 "NEUTRAL" 3 "DRIVE" ;
"#;

    fn database() -> DbcDatabase {
        DbcDatabase::from_dbc_content(TEST_DBC).unwrap()
    }

    #[test]
    fn test_message_lookup() {
        let db = database();
        assert!(db.has_message(291));
        assert!(db.has_message(512));
        assert!(!db.has_message(999));
        // extended-frame flag is stripped before matching
        assert!(db.has_message(291 | 0x8000_0000));
    }

    #[test]
    fn test_signals_of_preserves_order() {
        let db = database();
        assert_eq!(
            db.signals_of(291),
            vec!["ErrorCode", "FullRange", "GearPos"]
        );
    }

    #[test]
    fn test_message_id_of() {
        let db = database();
        assert_eq!(db.message_id_of("VehSpd"), Some(512));
        assert_eq!(db.message_id_of("ErrorCode"), Some(291));
        assert_eq!(db.message_id_of("NotThere"), None);
    }

    #[test]
    fn test_enum_map_extraction() {
        let db = database();
        let enums = db.enum_of("GearPos");
        assert_eq!(enums.len(), 4);
        assert_eq!(enums.value_of("DRIVE"), Some(3));
        assert_eq!(enums.label_of(0), Some("PARK"));
        assert!(db.enum_of("VehSpd").is_empty());
    }

    #[test]
    fn test_invalid_sentinel_decode() {
        // ErrorCode: 8-bit unsigned, range [0, 253]
        let db = database();

        let find = |data: [u8; 8]| {
            db.decode(291, &data)
                .into_iter()
                .find(|s| s.name == "ErrorCode")
                .unwrap()
        };

        let invalid = find([0xFF, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(invalid.quality, SignalQuality::Invalid);

        let na = find([0xFE, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(na.quality, SignalQuality::NotAvailable);

        let valid = find([0x64, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(valid.quality, SignalQuality::Valid);
        assert_eq!(valid.value, Value::Int64(100));
    }

    #[test]
    fn test_full_range_signal_has_no_sentinels() {
        // FullRange covers [0, 255], so 0xFF is a plain value
        let db = database();
        let signal = db
            .decode(291, &[0, 0xFF, 0, 0, 0, 0, 0, 0])
            .into_iter()
            .find(|s| s.name == "FullRange")
            .unwrap();
        assert_eq!(signal.quality, SignalQuality::Valid);
        assert_eq!(signal.value, Value::Int64(255));
    }

    #[test]
    fn test_scaled_signal_decodes_as_float() {
        let db = database();
        // raw 2500 * 0.01 = 25.0 km/h
        let signal = db
            .decode(512, &[0xC4, 0x09, 0, 0, 0, 0, 0, 0])
            .into_iter()
            .find(|s| s.name == "VehSpd")
            .unwrap();
        assert_eq!(signal.quality, SignalQuality::Valid);
        assert_eq!(signal.value, Value::Double(25.0));
    }

    #[test]
    fn test_signed_signal_decode() {
        let db = database();
        // LateralAccel is signed 8-bit with factor 0.1: raw 0xF6 = -10 -> -1.0
        let signal = db
            .decode(512, &[0, 0, 0xF6, 0, 0, 0, 0, 0])
            .into_iter()
            .find(|s| s.name == "LateralAccel")
            .unwrap();
        assert_eq!(signal.quality, SignalQuality::Valid);
        match signal.value {
            Value::Double(v) => assert!((v + 1.0).abs() < 1e-9),
            other => panic!("expected double, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_message_decodes_empty() {
        let db = database();
        assert!(db.decode(0x7FF, &[0; 8]).is_empty());
    }

    #[test]
    fn test_short_frame_omits_unfitting_signals() {
        let db = database();
        // only the first byte is present: ErrorCode decodes, the rest do not
        let decoded = db.decode(291, &[0x05]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "ErrorCode");
        assert_eq!(decoded[0].value, Value::Int64(5));
    }

    #[test]
    fn test_enum_signal_flag() {
        let db = database();
        let decoded = db.decode(291, &[0, 0, 0x03, 0, 0, 0, 0, 0]);
        let gear = decoded.iter().find(|s| s.name == "GearPos").unwrap();
        assert!(gear.has_enums);
        assert_eq!(gear.value, Value::Int64(3));
        let error = decoded.iter().find(|s| s.name == "ErrorCode").unwrap();
        assert!(!error.has_enums);
    }

    #[test]
    fn test_little_endian_extraction() {
        let data = [0xAB, 0xCD, 0, 0, 0, 0, 0, 0];
        assert_eq!(extract_little_endian(&data, 0, 8), 0xAB);
        assert_eq!(extract_little_endian(&data, 0, 16), 0xCDAB);
        assert_eq!(extract_little_endian(&data, 4, 8), 0xDA);
    }

    #[test]
    fn test_big_endian_extraction() {
        let data = [0xAB, 0xCD, 0, 0, 0, 0, 0, 0];
        assert_eq!(extract_big_endian(&data, 7, 8), 0xAB);
    }

    #[test]
    fn test_sign_extension() {
        assert_eq!(sign_extend(0x7F, 8), 127);
        assert_eq!(sign_extend(0xFF, 8), -1);
        assert_eq!(sign_extend(0x8000, 16), -32768);
        assert_eq!(sign_extend(0x01, 8), 1);
    }

    #[test]
    fn test_na_sentinel_on_small_field() {
        // GearPos is 3 bits with range [0, 5]: raw 7 is the invalid
        // sentinel, raw 6 the not-available sentinel
        let db = database();
        let decode_gear = |raw: u8| {
            db.decode(291, &[0, 0, raw, 0, 0, 0, 0, 0])
                .into_iter()
                .find(|s| s.name == "GearPos")
                .unwrap()
                .quality
        };
        assert_eq!(decode_gear(0x07), SignalQuality::Invalid);
        assert_eq!(decode_gear(0x06), SignalQuality::NotAvailable);
        assert_eq!(decode_gear(0x05), SignalQuality::Valid);
    }

    #[test]
    fn test_out_of_range_decodes_invalid() {
        // Temperature raw 150 -> physical 110, beyond the declared max of
        // 100 but not a sentinel pattern
        let db = database();
        let temperature = db
            .decode(291, &[0, 0, 0, 150, 0, 0, 0, 0])
            .into_iter()
            .find(|s| s.name == "Temperature")
            .unwrap();
        assert_eq!(temperature.quality, SignalQuality::Invalid);
        // offset scaling forces a float value
        assert_eq!(temperature.value, Value::Double(110.0));
    }
}
