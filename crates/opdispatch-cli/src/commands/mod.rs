pub mod explain;
pub mod keys;
pub mod ops;
pub mod schema;
