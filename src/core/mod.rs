pub mod error;
pub mod value;

pub use error::{DbError, Result};
pub use value::Value;

pub type Row = Vec<Value>;
