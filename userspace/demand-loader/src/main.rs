//! CONTEXT: demand-loader entrypoint wiring the CLI to the fault-driven loader
use std::process::ExitCode;

fn main() -> ExitCode {
    demand_loader::cli::run()
}
