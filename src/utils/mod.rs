pub mod command;
pub mod counts;
pub mod fastx;
pub mod file;
pub mod invoker;
pub mod streams;
pub mod system;
