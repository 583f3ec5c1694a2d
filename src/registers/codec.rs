//! Scaled, packed, enum and multi-word codec over raw register payloads.
//!
//! The generic read/write-multiple protocol path is big-endian across a
//! 32-bit/float register pair; the proprietary command path is
//! little-endian. Both encode/decode functions here take an explicit
//! [`Endian`] so the same logic serves both paths — see the endianness
//! trap note this carries forward from the source design notes.

use super::descriptor::{Access, PackedField, RegisterDescriptor, RegisterType};
use crate::error::{Error, Result};

/// Byte order for a 32-bit/float register pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Generic read/write path: MSB-first across the pair.
    Big,
    /// Proprietary command path: LSB-first across the pair.
    Little,
}

/// A decoded register value, one variant per [`RegisterType`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Number(f64),
    /// The descriptor's special sentinel raw value was observed.
    Sentinel(&'static str),
    Enum { raw: u16, label: &'static str },
    Packed(heapless::Vec<PackedDecoded, 8>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedDecoded {
    pub name: &'static str,
    pub raw: i32,
    pub value: f64,
}

/// Decode a single-word register (`U16`/`I16`/`Enum`/`Packed`) from its raw
/// 16-bit payload.
pub fn decode_word(raw: u16, d: &RegisterDescriptor) -> Result<DecodedValue> {
    if let Some(special) = d.special_raw {
        let as_i32 = match d.ty {
            RegisterType::I16 => raw as i16 as i32,
            _ => raw as i32,
        };
        if as_i32 == special.raw {
            return Ok(DecodedValue::Sentinel(special.meaning));
        }
    }

    match d.ty {
        RegisterType::U16 => Ok(DecodedValue::Number(scaled_decode(raw as i32, d))),
        RegisterType::I16 => Ok(DecodedValue::Number(scaled_decode(raw as i16 as i32, d))),
        RegisterType::Enum => {
            let table = d.enum_table.ok_or(Error::InvalidState)?;
            let label = table
                .iter()
                .find(|o| o.raw == raw)
                .map(|o| o.label)
                .ok_or(Error::InvalidArgument)?;
            Ok(DecodedValue::Enum { raw, label })
        }
        RegisterType::Packed => {
            let fields = d.packed_fields.ok_or(Error::InvalidState)?;
            let mut out: heapless::Vec<PackedDecoded, 8> = heapless::Vec::new();
            for f in fields {
                let raw_i = f.extract_signed(raw);
                let value = raw_i as f64 * f.scale;
                out.push(PackedDecoded { name: f.name, raw: raw_i, value })
                    .map_err(|_| Error::InvalidSize)?;
            }
            Ok(DecodedValue::Packed(out))
        }
        RegisterType::U32 | RegisterType::F32 => Err(Error::InvalidState),
    }
}

/// Decode a two-word `U32`/`F32` register from the register at `addr`
/// (`word_a`) and `addr+1` (`word_b`), given the wire endianness of the path
/// that produced it.
///
/// Generic path: `word_a` is the most-significant half of the 32-bit value.
/// Proprietary path: `word_a` is the least-significant half.
pub fn decode_pair(word_a: u16, word_b: u16, d: &RegisterDescriptor, endian: Endian) -> Result<DecodedValue> {
    let raw_bits = assemble_u32(word_a, word_b, endian);
    match d.ty {
        RegisterType::U32 => Ok(DecodedValue::Number(raw_bits as f64 * d.scale)),
        RegisterType::F32 => Ok(DecodedValue::Number(f32::from_bits(raw_bits) as f64 * d.scale)),
        _ => Err(Error::InvalidState),
    }
}

fn assemble_u32(word_a: u16, word_b: u16, endian: Endian) -> u32 {
    match endian {
        Endian::Big => ((word_a as u32) << 16) | word_b as u32,
        Endian::Little => ((word_b as u32) << 16) | word_a as u32,
    }
}

fn split_u32(bits: u32, endian: Endian) -> (u16, u16) {
    let hi = (bits >> 16) as u16;
    let lo = (bits & 0xFFFF) as u16;
    match endian {
        Endian::Big => (hi, lo),
        Endian::Little => (lo, hi),
    }
}

/// Encode a `U32`/`F32` user value back into its raw word pair
/// `(word_a, word_b)`, symmetric with [`decode_pair`].
pub fn encode_pair(value: f64, d: &RegisterDescriptor, endian: Endian) -> Result<(u16, u16)> {
    let bits = match d.ty {
        RegisterType::U32 => (value / d.scale).round().clamp(0.0, u32::MAX as f64) as u32,
        RegisterType::F32 => ((value / d.scale) as f32).to_bits(),
        _ => return Err(Error::InvalidState),
    };
    Ok(split_u32(bits, endian))
}

/// `user = (raw + offset) * scale`. `offset` is 0 for every descriptor this
/// gateway ships (kept explicit for symmetry with `scaled_encode`).
fn scaled_decode(raw: i32, d: &RegisterDescriptor) -> f64 {
    raw as f64 * d.scale
}

/// `raw = clamp(round(user / scale), min, max)`.
pub fn scaled_encode(user: f64, d: &RegisterDescriptor) -> Result<i32> {
    if !matches!(d.access, Access::Rw | Access::Wo) {
        return Err(Error::InvalidState);
    }
    let raw = (user / d.scale).round() as i32;
    let raw = match (d.min_raw, d.max_raw) {
        (Some(min), Some(max)) => raw.clamp(min, max),
        (Some(min), None) => raw.max(min),
        (None, Some(max)) => raw.min(max),
        (None, None) => raw,
    };
    Ok(raw)
}

/// Validate a write request: enum membership for `Enum` descriptors,
/// otherwise step-alignment and range.
pub fn validate_write(raw: i32, d: &RegisterDescriptor) -> Result<i32> {
    if !d.access.is_writable() {
        return Err(Error::InvalidState);
    }
    match d.ty {
        RegisterType::Enum => {
            if d.enum_contains(raw as u16) {
                Ok(raw)
            } else {
                Err(Error::InvalidArgument)
            }
        }
        _ => {
            let aligned = d.align_and_clamp(raw);
            if aligned == raw {
                Ok(raw)
            } else if d.in_range(raw) {
                Ok(raw)
            } else {
                Err(Error::InvalidArgument)
            }
        }
    }
}
