pub mod config;
pub mod infrastructure;
pub mod modules;
pub mod workers;
