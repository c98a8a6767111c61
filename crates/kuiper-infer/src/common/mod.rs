pub mod sampling;

pub use sampling::{ArgmaxSampler, Sampler, TemperatureSampler};
