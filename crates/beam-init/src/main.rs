//! `beam-init`: runs as PID 1 and boots the Erlang VM.
//!
//! See the library docs for the boot sequence.

use std::process::ExitCode;

use beam_init::{Config, logging, pid1, supervisor};

fn main() -> ExitCode {
    let (config, parse_error) = match Config::from_args(std::env::args_os()) {
        Ok(config) => (config, None),
        Err(e) if !pid1::is_pid1() => e.exit(),
        // PID 1 must not exit over bad arguments; boot with the defaults.
        Err(e) => (Config::default(), Some(e)),
    };

    logging::init(config.verbose);

    if let Some(e) = parse_error {
        tracing::warn!("ignoring init arguments: {e}");
    }

    if !pid1::is_pid1() {
        tracing::error!("Refusing to run since not pid 1");
        return ExitCode::FAILURE;
    }

    supervisor::run(&config)
}
