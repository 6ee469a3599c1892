//! Command-line front end for the demand loader.

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use thiserror::Error;

use crate::config::{ConfigError, LauncherConfig};

/// Environment variable holding an `env_logger` filter; overrides the config file.
pub const LOG_ENV: &str = "DEMAND_LOADER_LOG";

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Loader(#[from] crate::Error),
}

/// Runs a static executable, loading its pages on first touch.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "demand-loader",
    version,
    about,
    after_help = "Logging: set DEMAND_LOADER_LOG (e.g. info, debug)"
)]
pub struct Cli {
    /// Launcher configuration (TOML).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Executable followed by the arguments it receives. Everything after
    /// the executable path belongs to the launched program.
    #[arg(
        value_name = "EXECUTABLE",
        required = true,
        num_args = 1..,
        trailing_var_arg = true
    )]
    pub command: Vec<OsString>,
}

impl Cli {
    pub fn executable(&self) -> &Path {
        Path::new(self.command.first().map(OsString::as_os_str).unwrap_or_default())
    }

    /// argv of the launched program, starting with the executable path.
    pub fn argv(&self) -> Vec<Vec<u8>> {
        self.command.iter().map(|arg| arg.as_bytes().to_vec()).collect()
    }
}

/// Returns the CLI usage string.
pub fn help() -> String {
    Cli::command().render_help().to_string()
}

/// Loads configuration, initializes logging and the loader, then launches.
///
/// Only returns on failure.
pub fn execute(cli: &Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => LauncherConfig::load(path)?,
        None => LauncherConfig::default(),
    };
    init_logging(&config);

    crate::initialize()?;
    let env = config.environment(std::env::vars_os());
    match crate::execute_with_env(cli.executable(), &cli.argv(), &env)? {}
}

fn init_logging(config: &LauncherConfig) {
    let default_filter = config.log.level.as_deref().unwrap_or("warn");
    let env = env_logger::Env::default().filter_or(LOG_ENV, default_filter);
    // A second initialization (tests) is harmless.
    let _ = env_logger::Builder::from_env(env).format_timestamp(None).try_init();
}

/// Parses `std::env::args_os` and runs the loader.
///
/// Usage errors and loader failures both exit with status 1.
pub fn run() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };
    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("demand-loader: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(values: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("demand-loader").chain(values.iter().copied()))
    }

    #[test]
    fn help_contains_name() {
        assert!(help().contains("demand-loader"));
        assert_eq!(parse(&["--help"]).unwrap_err().kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn executable_and_arguments_become_argv() {
        let cli = parse(&["./hello", "-x", "--config"]).unwrap();
        assert_eq!(cli.executable(), Path::new("./hello"));
        assert_eq!(cli.argv(), vec![b"./hello".to_vec(), b"-x".to_vec(), b"--config".to_vec()]);
        assert!(cli.config.is_none());
    }

    #[test]
    fn config_option_precedes_executable() {
        let cli = parse(&["--config", "l.toml", "--", "-odd-name"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("l.toml")));
        assert_eq!(cli.executable(), Path::new("-odd-name"));
    }

    #[test]
    fn errors_are_reported() {
        assert_eq!(parse(&[]).unwrap_err().kind(), ErrorKind::MissingRequiredArgument);
        assert!(parse(&["--config"]).is_err());
        assert_eq!(parse(&["--verbose"]).unwrap_err().kind(), ErrorKind::UnknownArgument);
    }
}
