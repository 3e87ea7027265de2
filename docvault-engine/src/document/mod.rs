//! Document model and its JSON codec.

pub mod codec;
pub mod value;

pub use codec::{decode_line, encode_line, Fidelity};
pub use value::{Document, ObjectId, Value};
