//! DBC file loader
//!
//! Parses Vector DBC files with the `can-dbc` crate and converts them into a
//! [`SignalDatabase`]. The protocol tag comes from the `ProtocolType` network
//! attribute and value tables from the `VAL_` section of the parsed file.

use crate::signals::database::{
    ByteOrder, MessageDefinition, MultiplexerInfo, SignalDatabase, SignalDefinition, ValueType,
};
use crate::types::{Protocol, QueryError, Result};
use std::collections::HashMap;
use std::path::Path;

const PROTOCOL_TYPE: &str = "ProtocolType";

/// Load a DBC file into a signal database
pub fn load_dbc_file(path: &Path) -> Result<SignalDatabase> {
    log::info!("Loading DBC file: {:?}", path);

    // Read the DBC file as bytes first (handle non-UTF8 encodings)
    let bytes = std::fs::read(path).map_err(|e| {
        QueryError::DbcParse(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Try UTF-8 first, then fall back to Latin-1/Windows-1252
    let content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("DBC file {:?} is not UTF-8, trying Latin-1 encoding", path);
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let database = parse_dbc(&content).map_err(|e| match e {
        QueryError::DbcParse(msg) => QueryError::DbcParse(format!("{:?}: {}", path, msg)),
        other => other,
    })?;

    let stats = database.stats();
    log::info!(
        "Loaded {} messages / {} signals ({} protocol) from {:?}",
        stats.num_messages,
        stats.num_signals,
        database.protocol(),
        path
    );
    Ok(database)
}

/// Parse DBC content into a signal database
pub fn parse_dbc(content: &str) -> Result<SignalDatabase> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes())
        .map_err(|e| QueryError::DbcParse(format!("{:?}", e)))?;

    let mut database = SignalDatabase::new(detect_protocol(&dbc));
    for dbc_msg in dbc.messages() {
        database.add_message(convert_message(&dbc, dbc_msg)?);
    }

    Ok(database)
}

/// Read the protocol tag from the `ProtocolType` network attribute or its default
fn detect_protocol(dbc: &can_dbc::DBC) -> Protocol {
    let is_j1939 = |value: &can_dbc::AttributeValue| {
        matches!(value, can_dbc::AttributeValue::AttributeValueCharString(s) if s.eq_ignore_ascii_case("J1939"))
    };

    let network_value = dbc
        .attribute_values()
        .iter()
        .filter(|attr| attr.attribute_name() == PROTOCOL_TYPE)
        .find_map(|attr| match attr.attribute_value() {
            can_dbc::AttributeValuedForObjectType::RawAttributeValue(value) => Some(value),
            _ => None,
        });
    let default_value = || {
        dbc.attribute_defaults()
            .iter()
            .find(|attr| attr.attribute_name() == PROTOCOL_TYPE)
            .map(|attr| attr.attribute_value())
    };

    match network_value.or_else(default_value) {
        Some(value) if is_j1939(value) => Protocol::J1939,
        _ => Protocol::Generic,
    }
}

/// `VAL_` entries of one signal as raw value -> text
fn value_table(dbc: &can_dbc::DBC, message_id: u32, signal_name: &str) -> Option<HashMap<i64, String>> {
    let descriptions = dbc.value_descriptions_for_signal(can_dbc::MessageId(message_id), signal_name)?;
    let table: HashMap<i64, String> = descriptions
        .iter()
        .map(|desc| (*desc.a() as i64, desc.b().clone()))
        .collect();
    if table.is_empty() {
        None
    } else {
        Some(table)
    }
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(dbc: &can_dbc::DBC, dbc_msg: &can_dbc::Message) -> Result<MessageDefinition> {
    let mut is_multiplexed = false;
    let mut multiplexer_signal_name: Option<String> = None;

    // First pass: identify multiplexer signal
    for dbc_sig in dbc_msg.signals() {
        if let can_dbc::MultiplexIndicator::Multiplexor = dbc_sig.multiplexer_indicator() {
            is_multiplexed = true;
            multiplexer_signal_name = Some(dbc_sig.name().to_string());
            break;
        } else if matches!(
            dbc_sig.multiplexer_indicator(),
            can_dbc::MultiplexIndicator::MultiplexedSignal(_)
        ) {
            is_multiplexed = true;
        }
    }

    let id = dbc_msg.message_id().0;
    let signals = dbc_msg
        .signals()
        .iter()
        .map(|dbc_sig| {
            let value_table = value_table(dbc, id, dbc_sig.name());
            convert_signal(dbc_sig, multiplexer_signal_name.as_deref(), value_table)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(MessageDefinition {
        id,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        is_multiplexed,
        multiplexer_signal: multiplexer_signal_name,
    })
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(
    dbc_sig: &can_dbc::Signal,
    multiplexer_signal_name: Option<&str>,
    value_table: Option<HashMap<i64, String>>,
) -> Result<SignalDefinition> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let multiplexer_info = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value) => Some(MultiplexerInfo {
            multiplexer_signal: multiplexer_signal_name
                .ok_or_else(|| {
                    QueryError::DbcParse(format!(
                        "Multiplexed signal '{}' but no multiplexer found",
                        dbc_sig.name()
                    ))
                })?
                .to_string(),
            multiplexer_values: vec![switch_value as u64],
        }),
        _ => None,
    };

    Ok(SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        value_table,
        multiplexer_info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ENGINE_DBC: &str = r#"
VERSION ""

NS_ :
    NS_DESC_
    CM_
    BA_DEF_
    BA_
    VAL_

BS_:

BU_: ECU1 ECU2

BO_ 291 EngineData: 8 ECU1
 SG_ EngineSpeed : 0|16@1+ (1,0) [0|8000] "rpm" ECU2
 SG_ EngineTemp : 16|8@1+ (1,-40) [-40|215] "C" ECU2
 SG_ GearState : 24|2@1+ (1,0) [0|3] "" ECU2

BO_ 512 BatteryStatus: 8 ECU1
 SG_ BatteryVoltage : 0|16@1+ (0.01,0) [0|16] "V" ECU2

VAL_ 291 GearState 0 "Park" 1 "Reverse" 2 "Neutral" 3 "Drive" ;
"#;

    #[test]
    fn test_parse_simple_dbc() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(ENGINE_DBC.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let db = load_dbc_file(temp_file.path()).unwrap();
        assert_eq!(db.protocol(), Protocol::Generic);
        assert_eq!(db.stats().num_messages, 2);
        assert_eq!(db.stats().num_signals, 4);

        let msg = db.find_message(291).unwrap();
        assert_eq!(msg.name, "EngineData");
        assert_eq!(msg.size, 8);
        assert_eq!(msg.sender, Some("ECU1".to_string()));

        let speed = &msg.signals[0];
        assert_eq!(speed.name, "EngineSpeed");
        assert_eq!(speed.length, 16);
        assert_eq!(speed.unit, Some("rpm".to_string()));

        let temp = msg.signals.iter().find(|s| s.name == "EngineTemp").unwrap();
        assert_eq!(temp.offset, -40.0);
    }

    #[test]
    fn test_value_tables() {
        let db = parse_dbc(ENGINE_DBC).unwrap();
        let msg = db.find_message(291).unwrap();
        let gear = msg.signals.iter().find(|s| s.name == "GearState").unwrap();
        let table = gear.value_table.as_ref().unwrap();
        assert_eq!(table.get(&3), Some(&"Drive".to_string()));
        assert!(msg.signals[0].value_table.is_none());
    }

    #[test]
    fn test_parse_multiplexed_signals() {
        let dbc_content = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 512 MultiplexedMsg: 8 ECU1
 SG_ Mode M : 0|8@1+ (1,0) [0|3] "" ECU1
 SG_ SignalA m0 : 8|16@1+ (1,0) [0|100] "%" ECU1
 SG_ SignalB m1 : 8|16@1+ (0.1,0) [0|1000] "mV" ECU1
"#;

        let db = parse_dbc(dbc_content).unwrap();
        let msg = db.find_message(512).unwrap();
        assert!(msg.is_multiplexed);
        assert_eq!(msg.multiplexer_signal, Some("Mode".to_string()));

        let sig_a = msg.signals.iter().find(|s| s.name == "SignalA").unwrap();
        let mux = sig_a.multiplexer_info.as_ref().unwrap();
        assert_eq!(mux.multiplexer_signal, "Mode");
        assert_eq!(mux.multiplexer_values, vec![0]);
    }

    #[test]
    fn test_detect_j1939_protocol() {
        let content = r#"
VERSION ""

NS_ :
    BA_DEF_
    BA_

BS_:

BU_: ECU1

BO_ 2364540158 EEC1: 8 ECU1
 SG_ EngineSpeed : 24|16@1+ (0.125,0) [0|8031.875] "rpm" Vector__XXX

BA_DEF_  "ProtocolType" STRING ;
BA_ "ProtocolType" "J1939";
"#;
        let db = parse_dbc(content).unwrap();
        assert_eq!(db.protocol(), Protocol::J1939);

        // Without the attribute the database is generic
        assert_eq!(parse_dbc(ENGINE_DBC).unwrap().protocol(), Protocol::Generic);
    }

    #[test]
    fn test_missing_file() {
        let result = load_dbc_file(Path::new("does-not-exist.dbc"));
        assert!(matches!(result, Err(QueryError::DbcParse(_))));
    }
}
