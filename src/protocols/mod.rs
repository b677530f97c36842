//! Protocol clients: a uniform probe/read/close surface over Modbus-TCP
//! and OPC-UA sessions
//!
//! Real drivers are deliberately behind the [`SessionFactory`] seam: the
//! engine and the device supervisor only ever see trait objects. The
//! built-in factory (see [`probe`]) does TCP-level probes, which is enough
//! for connectivity status; embedders plug in driver-backed factories, and
//! tests plug in scripted ones.

pub mod probe;

use crate::errors::{AppError, AppResult};
use crate::models::{Device, FieldType, MappingRow, Protocol};
use serde::{Deserialize, Serialize};

/// A value read from a device tag. Scaling applies to the numeric variants
/// only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I64(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Multiply numeric variants by `scale`; everything else passes through
    pub fn scaled(self, scale: Option<f64>) -> Value {
        match (scale, &self) {
            (Some(s), Value::I64(v)) => Value::F64(*v as f64 * s),
            (Some(s), Value::F64(v)) => Value::F64(v * s),
            _ => self,
        }
    }

    /// SQL parameter for a row insert
    pub fn to_sql(&self) -> rusqlite::types::Value {
        match self {
            Value::Null => rusqlite::types::Value::Null,
            Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
            Value::I64(v) => rusqlite::types::Value::Integer(*v),
            Value::F64(v) => rusqlite::types::Value::Real(*v),
            Value::Str(s) => rusqlite::types::Value::Text(s.clone()),
        }
    }
}

/// Modbus register family, derived from the conventional address ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModbusFunction {
    Holding,
    Input,
    Coil,
}

/// Addressable variable on a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Tag {
    Modbus {
        address: u32,
        function: ModbusFunction,
        data_type: FieldType,
    },
    Opcua {
        node_id: String,
    },
}

/// Resolve a mapping row into a concrete tag address
pub fn tag_for_row(field_key: &str, row: &MappingRow) -> AppResult<Tag> {
    let address = row.address.trim();
    if address.is_empty() {
        return Err(AppError::Mapping {
            field: field_key.to_string(),
            code: "MAPPING_INCOMPLETE".into(),
        });
    }
    match row.protocol {
        Protocol::Opcua => Ok(Tag::Opcua {
            node_id: address.to_string(),
        }),
        Protocol::Modbus => {
            let raw: u32 = address.parse().map_err(|_| AppError::Mapping {
                field: field_key.to_string(),
                code: "MAPPING_TYPE_MISMATCH".into(),
            })?;
            let data_type = row.data_type.ok_or_else(|| AppError::Mapping {
                field: field_key.to_string(),
                code: "MAPPING_INCOMPLETE".into(),
            })?;
            // conventional address map: 4xxxx holding, 3xxxx input, 1xxxx coil
            let (function, offset) = if raw >= 40001 {
                (ModbusFunction::Holding, raw - 40001)
            } else if raw >= 30001 {
                (ModbusFunction::Input, raw - 30001)
            } else if raw >= 10001 {
                (ModbusFunction::Coil, raw - 10001)
            } else {
                (ModbusFunction::Holding, raw)
            };
            Ok(Tag::Modbus {
                address: offset,
                function,
                data_type,
            })
        }
    }
}

/// Non-routable wildcard endpoints are rewritten to loopback before connect
pub fn rewrite_wildcard_endpoint(endpoint: &str) -> String {
    endpoint.replace("0.0.0.0", "127.0.0.1")
}

/// Result of a connectivity probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub latency_ms: i64,
    pub error: Option<String>,
}

/// One open session against a device. Sessions are single-threaded;
/// callers must serialize access.
#[cfg_attr(test, mockall::automock)]
pub trait ProtocolSession: Send {
    /// Cheap health check returning measured latency
    fn probe(&mut self) -> ProbeOutcome;

    /// Read one tag; `Value::Null` is a valid reading (bad quality)
    fn read(&mut self, tag: &Tag) -> AppResult<Value>;

    /// Idempotent teardown
    fn close(&mut self);
}

/// Opens sessions from a device's protocol and params
#[cfg_attr(test, mockall::automock)]
pub trait SessionFactory: Send + Sync {
    fn open(&self, device: &Device) -> AppResult<Box<dyn ProtocolSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(protocol: Protocol, address: &str, data_type: Option<FieldType>) -> MappingRow {
        MappingRow {
            protocol,
            address: address.into(),
            data_type,
            scale: None,
            deadband: None,
        }
    }

    #[test]
    fn scaling_applies_to_numeric_variants_only() {
        assert_eq!(Value::I64(10).scaled(Some(0.1)), Value::F64(1.0));
        assert_eq!(Value::F64(230.0).scaled(Some(2.0)), Value::F64(460.0));
        assert_eq!(Value::Bool(true).scaled(Some(0.5)), Value::Bool(true));
        assert_eq!(
            Value::Str("x".into()).scaled(Some(0.5)),
            Value::Str("x".into())
        );
        assert_eq!(Value::Null.scaled(Some(0.5)), Value::Null);
        assert_eq!(Value::I64(10).scaled(None), Value::I64(10));
    }

    #[test]
    fn modbus_address_conventions() {
        let tag = tag_for_row("f", &row(Protocol::Modbus, "40005", Some(FieldType::Int))).unwrap();
        assert_eq!(
            tag,
            Tag::Modbus {
                address: 4,
                function: ModbusFunction::Holding,
                data_type: FieldType::Int
            }
        );
        let tag = tag_for_row("f", &row(Protocol::Modbus, "30001", Some(FieldType::Float))).unwrap();
        assert!(matches!(tag, Tag::Modbus { function: ModbusFunction::Input, address: 0, .. }));
        let tag = tag_for_row("f", &row(Protocol::Modbus, "10003", Some(FieldType::Bool))).unwrap();
        assert!(matches!(tag, Tag::Modbus { function: ModbusFunction::Coil, address: 2, .. }));
        let tag = tag_for_row("f", &row(Protocol::Modbus, "7", Some(FieldType::Int))).unwrap();
        assert!(matches!(tag, Tag::Modbus { function: ModbusFunction::Holding, address: 7, .. }));
    }

    #[test]
    fn modbus_rows_need_numeric_address_and_type() {
        assert_eq!(
            tag_for_row("f", &row(Protocol::Modbus, "abc", Some(FieldType::Int)))
                .unwrap_err()
                .code(),
            "MAPPING_TYPE_MISMATCH"
        );
        assert_eq!(
            tag_for_row("f", &row(Protocol::Modbus, "40001", None))
                .unwrap_err()
                .code(),
            "MAPPING_INCOMPLETE"
        );
        assert_eq!(
            tag_for_row("f", &row(Protocol::Opcua, " ", None))
                .unwrap_err()
                .code(),
            "MAPPING_INCOMPLETE"
        );
    }

    #[test]
    fn wildcard_endpoints_are_rewritten() {
        assert_eq!(
            rewrite_wildcard_endpoint("opc.tcp://0.0.0.0:4840/server"),
            "opc.tcp://127.0.0.1:4840/server"
        );
        assert_eq!(
            rewrite_wildcard_endpoint("opc.tcp://10.1.2.3:4840"),
            "opc.tcp://10.1.2.3:4840"
        );
    }
}
