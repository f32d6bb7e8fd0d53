pub mod args;

use clap::Parser;

pub use args::{Arguments, Command};

pub fn parse() -> Arguments {
    Arguments::parse()
}
