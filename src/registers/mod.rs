//! Register descriptor table and the codec that decodes/encodes raw
//! payloads against it.

pub mod codec;
pub mod descriptor;
pub mod table;

pub use codec::{decode_pair, decode_word, encode_pair, scaled_encode, validate_write, DecodedValue, Endian};
pub use descriptor::{Access, EnumOption, PackedField, RegisterDescriptor, RegisterType, SpecialRaw};
