pub mod api;
pub mod config;
pub mod course;
pub mod db;
pub mod error;
pub mod exam;
pub mod gamification;
pub mod legacy;
pub mod oracle;
pub mod progress;
pub mod server;
pub mod shop;
pub mod student;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
