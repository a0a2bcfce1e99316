//! Numeric sample types stored in raster payloads.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Storage type of one component of a raster element.
///
/// Raster blocks describe components by (bit size, mantissa, signed); this
/// enum is the decoded form used when samples have to be interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ScalarType {
    #[default]
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
}

impl ScalarType {
    /// Decode from a component layout.
    ///
    /// A mantissa narrower than the bit size marks an IEEE float. Integer
    /// widths that are not a whole byte count round up to the next storage size.
    pub fn from_layout(bit_size: u64, mantissa: u64, signed: bool) -> Option<Self> {
        let float = mantissa < bit_size;
        Some(match (bit_size, float, signed) {
            (32, true, _) => Self::Float32,
            (64, true, _) => Self::Float64,
            (_, true, _) => return None,
            (1..=8, false, false) => Self::Uint8,
            (1..=8, false, true) => Self::Int8,
            (9..=16, false, false) => Self::Uint16,
            (9..=16, false, true) => Self::Int16,
            (17..=32, false, false) => Self::Uint32,
            (17..=32, false, true) => Self::Int32,
            (33..=64, false, false) => Self::Uint64,
            (33..=64, false, true) => Self::Int64,
            _ => return None,
        })
    }

    /// Returns the size in bytes of a single value of this type.
    #[inline]
    pub const fn num_bytes(self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 => 2,
            Self::Uint32 | Self::Int32 | Self::Float32 => 4,
            Self::Uint64 | Self::Int64 | Self::Float64 => 8,
        }
    }

    /// Returns the name of this type as a string.
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Uint8 => "uint8",
            Self::Int8 => "int8",
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint32 => "uint32",
            Self::Int32 => "int32",
            Self::Uint64 => "uint64",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Read one little-endian value as `f64`.
    ///
    /// `bytes` must hold at least [`Self::num_bytes`] bytes.
    #[inline]
    pub fn read_f64(self, bytes: &[u8]) -> f64 {
        match self {
            Self::Uint8 => bytes[0] as f64,
            Self::Int8 => bytes[0] as i8 as f64,
            Self::Uint16 => LittleEndian::read_u16(bytes) as f64,
            Self::Int16 => LittleEndian::read_i16(bytes) as f64,
            Self::Uint32 => LittleEndian::read_u32(bytes) as f64,
            Self::Int32 => LittleEndian::read_i32(bytes) as f64,
            Self::Uint64 => LittleEndian::read_u64(bytes) as f64,
            Self::Int64 => LittleEndian::read_i64(bytes) as f64,
            Self::Float32 => LittleEndian::read_f32(bytes) as f64,
            Self::Float64 => LittleEndian::read_f64(bytes),
        }
    }

    /// Write `value` little-endian, rounding and saturating for integer types.
    #[inline]
    pub fn write_f64(self, out: &mut [u8], value: f64) {
        // `as` casts from f64 saturate at the integer bounds
        let v = value.round();
        match self {
            Self::Uint8 => out[0] = v as u8,
            Self::Int8 => out[0] = (v as i8) as u8,
            Self::Uint16 => LittleEndian::write_u16(out, v as u16),
            Self::Int16 => LittleEndian::write_i16(out, v as i16),
            Self::Uint32 => LittleEndian::write_u32(out, v as u32),
            Self::Int32 => LittleEndian::write_i32(out, v as i32),
            Self::Uint64 => LittleEndian::write_u64(out, v as u64),
            Self::Int64 => LittleEndian::write_i64(out, v as i64),
            Self::Float32 => LittleEndian::write_f32(out, value as f32),
            Self::Float64 => LittleEndian::write_f64(out, value),
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
