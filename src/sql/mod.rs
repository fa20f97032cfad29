pub mod classifier;
pub mod interpolate;
pub mod query;

pub use classifier::{StatementKind, classify, normalize};
pub use interpolate::interpolate;
pub use query::Query;
