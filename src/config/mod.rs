pub mod defs;
pub mod resolve;
pub mod settings;
