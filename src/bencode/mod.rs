//! Bencode codec
//!
//! Encodes and decodes the Bencode format used by metainfo files, tracker
//! responses and persisted records.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::{decode, decode_prefix, dict_value_span};
pub use encode::encode;
pub use value::Value;
