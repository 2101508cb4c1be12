#![allow(dead_code)]
#![cfg_attr(not(test), no_std)]

pub mod callbacks;
pub mod config;
pub mod crc;
pub mod engine;
pub mod error;
pub mod frame;
pub mod registers;

pub use config::{baud_from_index, DeferredWork, PersistedConfig};
pub use engine::{Config, Engine, Link, Polarity, Rs485Config};
pub use error::{DropReason, Exception, InitError};
pub use registers::{BitRegion, RegisterFile, WordRegion};
