pub mod clock;
pub mod config;
pub mod context;
pub mod definition;
pub mod types;
