//! Source adapters: field catalog, record normalization, upstream payload
//! shape detection and delimited-file reading.

pub mod catalog;
pub mod delimited;
pub mod normalize;
pub mod payload;

pub use catalog::{CanonicalField, FieldCatalog};
pub use delimited::{parse_delimited, read_delimited};
pub use normalize::{fold_key, parse_number, parse_text, resolve, MissingKeyFields, Normalizer, Resolved};
pub use payload::{extract_records, ExtractedBatch, PayloadError, PayloadShape, WRAPPER_KEYS};

pub const CRATE_NAME: &str = "redi-adapters";
