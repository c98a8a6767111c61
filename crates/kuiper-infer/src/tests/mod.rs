pub mod common;

mod gpu_parity;
mod layer_tests;
