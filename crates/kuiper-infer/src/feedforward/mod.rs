//! Gated feed-forward activation.

pub mod swiglu;

pub use swiglu::SwiGluLayer;

#[cfg(test)]
mod tests;
