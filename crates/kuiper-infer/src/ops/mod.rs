//! Parameter-free element-wise operators.

pub mod add;

pub use add::AddLayer;
