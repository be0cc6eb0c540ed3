//! Repository implementations for database operations

pub mod backtest;

pub use backtest::*;
