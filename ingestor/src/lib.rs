pub mod ops;
pub mod sink;
