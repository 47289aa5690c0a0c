pub mod cli;
pub mod config;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod geocoder;
pub mod loader;
pub mod parser;
pub mod progress;
