//! CLI command implementations.

pub mod init;
pub mod inspect;
pub mod list;
pub mod parsers;
pub mod reset;
pub mod rm;
pub mod set;
pub mod start;
pub mod stop;

use std::io::{BufRead, Write};

/// Machine name used when none is given.
pub const DEFAULT_MACHINE: &str = "machina-default";

/// Ask a yes/no question on stderr. Anything but `y`/`yes` declines.
pub fn confirm(prompt: &str) -> bool {
    eprint!("{} [y/N] ", prompt);
    let _ = std::io::stderr().flush();
    let mut input = String::new();
    match std::io::stdin().lock().read_line(&mut input) {
        Ok(_) => parsers::is_yes(&input),
        Err(_) => false,
    }
}
