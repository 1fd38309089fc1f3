//! Decoding of downloaded log files.
//!
//! A log file is a run of fixed-width little-endian records whose layout
//! depends on the firmware that wrote it. The firmware version string picks
//! the layout: the first rule whose pattern occurs in the version wins, and a
//! version matching no rule falls back to `std`.
//!
//! Decoding also repairs the tick counter. A counter that went negative has
//! wrapped; it is replaced by an evenly spaced ramp from zero using the first
//! sampling interval. Otherwise the counter is re-based to start at zero.
//! Seconds since start are added as column `t` right after the counter.

pub mod layout;
pub mod table;

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

pub use layout::{
    COUNTER_COLUMN, FieldKind, FieldSpec, FirmwareRecordLayout, LayoutKey, SECONDS_COLUMN,
};
pub use table::{Column, DecodedTable, NamedColumn, Value};

/// Ordered firmware dispatch rules plus the layouts they lead to.
#[derive(Debug, Clone)]
pub struct LayoutRegistry {
    rules: Vec<(String, LayoutKey)>,
    layouts: HashMap<LayoutKey, FirmwareRecordLayout>,
}

impl Default for LayoutRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl LayoutRegistry {
    /// A registry with no rules and no layouts.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            layouts: HashMap::new(),
        }
    }

    /// The firmware variants shipped on the logger.
    pub fn builtin() -> Self {
        let mut registry = Self::new()
            .with_rule("i2c_2", LayoutKey::I2c2)
            .with_rule("i2c_1", LayoutKey::I2c1);
        for key in LayoutKey::ALL {
            registry = registry.with_layout(FirmwareRecordLayout::builtin(key));
        }
        registry
    }

    /// Append a dispatch rule. Earlier rules take priority.
    #[must_use]
    pub fn with_rule(mut self, pattern: impl Into<String>, key: LayoutKey) -> Self {
        self.rules.push((pattern.into(), key));
        self
    }

    /// Register a layout, replacing any with the same key.
    #[must_use]
    pub fn with_layout(mut self, layout: FirmwareRecordLayout) -> Self {
        self.layouts.insert(layout.key(), layout);
        self
    }

    /// Layout key for a firmware version string.
    pub fn key_for(&self, firmware: &str) -> LayoutKey {
        self.rules
            .iter()
            .find(|(pattern, _)| firmware.contains(pattern.as_str()))
            .map_or(LayoutKey::Std, |(_, key)| *key)
    }

    /// Layout registered under `key`.
    pub fn layout(&self, key: LayoutKey) -> Option<&FirmwareRecordLayout> {
        self.layouts.get(&key)
    }

    /// Layout for a firmware version string.
    pub fn layout_for(&self, firmware: &str) -> Result<&FirmwareRecordLayout> {
        let key = self.key_for(firmware);
        self.layout(key).ok_or_else(|| {
            Error::UnsupportedFirmware(format!("{firmware:?} (no {key} layout)"))
        })
    }

    /// Decode raw log bytes written by `firmware`.
    pub fn decode(&self, bytes: &[u8], firmware: &str) -> Result<DecodedTable> {
        decode_with_layout(self.layout_for(firmware)?, bytes)
    }

    /// Decode a log file written by `firmware`.
    pub fn decode_file(&self, path: &Path, firmware: &str) -> Result<DecodedTable> {
        let layout = self.layout_for(firmware)?;
        let bytes = fs::read(path)?;
        debug!("Decoding {} ({} bytes, {})", path.display(), bytes.len(), layout.key());
        decode_with_layout(layout, &bytes)
    }
}

/// Decode raw log bytes with the built-in layouts.
pub fn decode(bytes: &[u8], firmware: &str) -> Result<DecodedTable> {
    LayoutRegistry::builtin().decode(bytes, firmware)
}

/// Decode a log file with the built-in layouts.
pub fn decode_file(path: &Path, firmware: &str) -> Result<DecodedTable> {
    LayoutRegistry::builtin().decode_file(path, firmware)
}

/// Repair a tick counter column.
///
/// Any negative value means the counter wrapped; the column is then replaced
/// by `0, step, 2 * step, ...` where `step` is the difference between the
/// first two recorded values. Otherwise every value is re-based on the first.
pub fn correct_rollover(ticks: &[i64]) -> Vec<i64> {
    let Some(&first) = ticks.first() else {
        return Vec::new();
    };

    if ticks.iter().any(|t| *t < 0) {
        let step = ticks.get(1).map_or(0, |second| second - first);
        warn!("Tick counter wrapped; synthesizing {step} us steps");
        (0_i64..)
            .take(ticks.len())
            .map(|k| k * step)
            .collect()
    } else {
        ticks.iter().map(|t| t - first).collect()
    }
}

fn read_value<R: Read>(reader: &mut R, kind: FieldKind) -> io::Result<Value> {
    Ok(match kind {
        FieldKind::I16 => Value::Int(i64::from(reader.read_i16::<LittleEndian>()?)),
        FieldKind::I32 => Value::Int(i64::from(reader.read_i32::<LittleEndian>()?)),
        FieldKind::F32 => Value::Float(f64::from(reader.read_f32::<LittleEndian>()?)),
    })
}

/// Decode raw log bytes with an explicit layout.
pub fn decode_with_layout(layout: &FirmwareRecordLayout, bytes: &[u8]) -> Result<DecodedTable> {
    let record_size = layout.record_size();
    if record_size == 0 {
        return Err(Error::UnsupportedFirmware(format!(
            "{} layout has no fields",
            layout.key()
        )));
    }

    let count = bytes.len() / record_size;
    let trailing = bytes.len() % record_size;
    if trailing != 0 {
        warn!(
            "Ignoring {trailing} trailing byte(s) after {count} {} record(s)",
            layout.key()
        );
    }

    let mut columns: Vec<Column> = layout
        .fields()
        .iter()
        .map(|field| {
            if field.kind.is_float() {
                Column::Float(Vec::with_capacity(count))
            } else {
                Column::Int(Vec::with_capacity(count))
            }
        })
        .collect();

    let mut reader = &bytes[..count * record_size];
    for _ in 0..count {
        for (field, column) in layout.fields().iter().zip(columns.iter_mut()) {
            column.push(read_value(&mut reader, field.kind)?);
        }
    }

    let mut decoded: HashMap<&str, Column> = layout
        .fields()
        .iter()
        .map(|field| field.name)
        .zip(columns)
        .collect();

    let corrected = match decoded.get(COUNTER_COLUMN) {
        Some(Column::Int(ticks)) => Some(correct_rollover(ticks)),
        _ => None,
    };
    if let Some(ticks) = corrected {
        let seconds = ticks.iter().map(|t| *t as f64 * 1e-6).collect();
        decoded.insert(COUNTER_COLUMN, Column::Int(ticks));
        decoded.insert(SECONDS_COLUMN, Column::Float(seconds));
    }

    let ordered = layout
        .canonical_order()
        .iter()
        .filter_map(|name| {
            decoded.remove(name).map(|values| NamedColumn {
                name: (*name).to_string(),
                values,
            })
        })
        .collect();

    Ok(DecodedTable::from_columns(ordered))
}
