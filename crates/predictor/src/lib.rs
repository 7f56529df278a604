//! Price sensitivity prediction server

pub mod api;
pub mod config;
