pub mod cli;
pub mod config;
pub mod container;
pub mod driver;
pub mod instances;
pub mod vertex;
