//! Binary record layouts, one per firmware variant.
//!
//! Every record starts with a 32-bit microsecond tick counter followed by the
//! variant's channel fields, all little-endian:
//!
//! ```text
//! std    (76 bytes): tmicros | d0..d2 e0..e2 f0..f2 c0..c2 a0..a2 b0..b2 (i16) | gx..Tz (f32)
//! i2c_1  (76 bytes): tmicros | a0..a2 b0..b2 c0..c2 d0..d2 (i16) | gx..Tz (f32) | p0..p2 (f32)
//! i2c_2  (88 bytes): i2c_1 | q0..q2 (f32)
//! ```

use std::fmt;

/// Name of the tick counter column every layout starts with.
pub const COUNTER_COLUMN: &str = "tmicros";

/// Name of the derived seconds column inserted after the counter.
pub const SECONDS_COLUMN: &str = "t";

/// Numeric type of one on-wire field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// IEEE 754 single precision.
    F32,
}

impl FieldKind {
    /// Width in bytes.
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
        }
    }

    /// Whether values decode to floating point.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32)
    }
}

/// One named field of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Column name.
    pub name: &'static str,
    /// Numeric type.
    pub kind: FieldKind,
}

impl FieldSpec {
    const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// Firmware variants with a known record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LayoutKey {
    /// Base firmware with on-board sensors only.
    #[default]
    Std,
    /// Firmware with one external I2C sensor.
    I2c1,
    /// Firmware with two external I2C sensors.
    I2c2,
}

impl LayoutKey {
    /// Every key.
    pub const ALL: [Self; 3] = [Self::Std, Self::I2c1, Self::I2c2];

    /// Name used in firmware version strings.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Std => "std",
            Self::I2c1 => "i2c_1",
            Self::I2c2 => "i2c_2",
        }
    }

    /// Parse a layout name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "std" => Some(Self::Std),
            "i2c_1" => Some(Self::I2c1),
            "i2c_2" => Some(Self::I2c2),
            _ => None,
        }
    }
}

impl fmt::Display for LayoutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-width binary record description for one firmware variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRecordLayout {
    key: LayoutKey,
    fields: Vec<FieldSpec>,
    canonical_order: Vec<&'static str>,
}

impl FirmwareRecordLayout {
    /// Describe a layout. `fields` are in wire order and must start with the
    /// tick counter.
    pub fn new(key: LayoutKey, fields: Vec<FieldSpec>, canonical_order: Vec<&'static str>) -> Self {
        Self {
            key,
            fields,
            canonical_order,
        }
    }

    /// Layout key.
    pub fn key(&self) -> LayoutKey {
        self.key
    }

    /// Fields in wire order.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Output column order, including columns this layout may not produce.
    pub fn canonical_order(&self) -> &[&'static str] {
        &self.canonical_order
    }

    /// Bytes per record.
    pub fn record_size(&self) -> usize {
        self.fields.iter().map(|f| f.kind.width()).sum()
    }

    /// The standard layout.
    pub fn std() -> Self {
        use FieldKind::{F32, I16, I32};

        // The tick is a u32 on the device; reading it as i32 makes a wrap
        // visible as a negative value.
        let mut fields = vec![FieldSpec::new(COUNTER_COLUMN, I32)];
        fields.extend(
            [
                "d0", "d1", "d2", "e0", "e1", "e2", "f0", "f1", "f2", "c0", "c1", "c2", "a0",
                "a1", "a2", "b0", "b1", "b2",
            ]
            .map(|name| FieldSpec::new(name, I16)),
        );
        fields.extend(IMU_FLOATS.map(|name| FieldSpec::new(name, F32)));

        let mut order = vec![COUNTER_COLUMN, SECONDS_COLUMN];
        order.extend(ADC_CHANNELS);
        order.extend(["e0", "e1", "e2", "f0", "f1", "f2"]);
        order.extend(IMU_FLOATS);

        Self::new(LayoutKey::Std, fields, order)
    }

    /// Layout with one external I2C sensor.
    pub fn i2c_1() -> Self {
        Self::new(LayoutKey::I2c1, i2c_fields(&[&P_CHANNELS]), i2c_order())
    }

    /// Layout with two external I2C sensors.
    pub fn i2c_2() -> Self {
        Self::new(
            LayoutKey::I2c2,
            i2c_fields(&[&P_CHANNELS, &Q_CHANNELS]),
            i2c_order(),
        )
    }

    /// Built-in layout for `key`.
    pub fn builtin(key: LayoutKey) -> Self {
        match key {
            LayoutKey::Std => Self::std(),
            LayoutKey::I2c1 => Self::i2c_1(),
            LayoutKey::I2c2 => Self::i2c_2(),
        }
    }
}

const ADC_CHANNELS: [&str; 12] = [
    "a0", "a1", "a2", "b0", "b1", "b2", "c0", "c1", "c2", "d0", "d1", "d2",
];
const IMU_FLOATS: [&str; 9] = ["gx", "gy", "gz", "wx", "wy", "wz", "Tx", "Ty", "Tz"];
const P_CHANNELS: [&str; 3] = ["p0", "p1", "p2"];
const Q_CHANNELS: [&str; 3] = ["q0", "q1", "q2"];

fn i2c_fields(external: &[&[&'static str; 3]]) -> Vec<FieldSpec> {
    let mut fields = vec![FieldSpec::new(COUNTER_COLUMN, FieldKind::I32)];
    fields.extend(ADC_CHANNELS.map(|name| FieldSpec::new(name, FieldKind::I16)));
    fields.extend(IMU_FLOATS.map(|name| FieldSpec::new(name, FieldKind::F32)));
    for sensor in external {
        fields.extend(sensor.map(|name| FieldSpec::new(name, FieldKind::F32)));
    }
    fields
}

fn i2c_order() -> Vec<&'static str> {
    let mut order = vec![COUNTER_COLUMN, SECONDS_COLUMN];
    order.extend(ADC_CHANNELS);
    order.extend(IMU_FLOATS);
    order.extend(P_CHANNELS);
    order.extend(Q_CHANNELS);
    order
}
