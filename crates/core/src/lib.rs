pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod loader;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod parser;
pub mod ports;
pub mod resolver;
pub mod schema;
pub mod utils;
