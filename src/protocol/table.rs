//! Binary sensor table decoding.
//!
//! A sensor table is a flat sequence of fixed-width entries, one per reading:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 1    | sensor id (`u8`)                        |
//! | 1      | 1    | value type (`0` integer, `1` float)     |
//! | 2      | 4    | payload                                 |
//!
//! Integer entries only use the first payload byte. Float entries hold a
//! little-endian IEEE-754 single precision value across all four.
use std::fmt;

use bincode::{Decode, Encode};
use thiserror::Error;

pub(crate) const ENTRY_SIZE: usize = 6;

const ENTRY_ID: usize = 0;
const ENTRY_TYPE: usize = ENTRY_ID + 1;
const ENTRY_PAYLOAD: usize = ENTRY_TYPE + 1;

const TYPE_INT: u8 = 0x0;
const TYPE_FLOAT: u8 = 0x1;

/// Identifier of a sensor on the device bus.
pub type SensorId = u8;

/// A single decoded sensor value.
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub enum Value {
    Int(u8),
    Float(f32),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("table length {0} is not a multiple of {ENTRY_SIZE}")]
    Length(usize),

    #[error("entry {index} for sensor {sensor_id} has unknown value type {tag}")]
    UnknownType {
        index: usize,
        sensor_id: SensorId,
        tag: u8,
    },
}

/// Decodes a sensor table into `(sensor_id, value)` readings, preserving input order.
pub fn decode(buf: &[u8]) -> Result<Vec<(SensorId, Value)>, TableError> {
    if buf.len() % ENTRY_SIZE != 0 {
        return Err(TableError::Length(buf.len()));
    }

    buf.chunks_exact(ENTRY_SIZE)
        .enumerate()
        .map(|(index, entry)| {
            let sensor_id = entry[ENTRY_ID];
            let value = match entry[ENTRY_TYPE] {
                TYPE_INT => Value::Int(entry[ENTRY_PAYLOAD]),
                TYPE_FLOAT => {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&entry[ENTRY_PAYLOAD..ENTRY_SIZE]);
                    Value::Float(f32::from_le_bytes(raw))
                }
                tag => {
                    return Err(TableError::UnknownType {
                        index,
                        sensor_id,
                        tag,
                    });
                }
            };
            Ok((sensor_id, value))
        })
        .collect()
}

/// Encodes readings back into the table layout. Integer entries zero their
/// unused payload bytes.
pub fn encode(entries: &[(SensorId, Value)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * ENTRY_SIZE);
    for (sensor_id, value) in entries {
        out.push(*sensor_id);
        match value {
            Value::Int(v) => {
                out.push(TYPE_INT);
                out.extend_from_slice(&[*v, 0, 0, 0]);
            }
            Value::Float(v) => {
                out.push(TYPE_FLOAT);
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
    out
}
