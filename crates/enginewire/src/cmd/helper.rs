use std::thread;
use std::time::Duration;

use crate::cmd::HelperArgs;
use crate::exit::CliResult;

/// A stand-in for an engine's own child processes. Exits only when killed.
pub fn run(_args: HelperArgs) -> CliResult<i32> {
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
