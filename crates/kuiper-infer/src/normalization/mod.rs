pub mod rms_norm;

pub use rms_norm::RmsNormLayer;

#[cfg(test)]
mod tests;
