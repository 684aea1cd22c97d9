//! A core module for command line interface.
//!
//! See [`Cli`] for more information.

use std::path::PathBuf;

use clap::builder::{PathBufValueParser, TypedValueParser};
use clap::error::ErrorKind;
use clap::{ArgAction, Command};
pub use clap::{CommandFactory, Parser};
use dialoguer::Editor;

use crate::config::{Config, Validate, DEFAULT_CONFIG_STR};

const EDITOR_EXTENSION: &str = ".toml";

/// [`clap`] command line interface.
///
/// The config file is parsed with [`toml`], then checked with [`Config::validate`].
///
/// # Example
///
/// ```no_run
/// use booru_curator::cli::{Cli, Parser as _};
///
/// let cli = Cli::parse();
/// ```
#[non_exhaustive]
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// The config file to use.
    ///
    /// If `None`, you can use [`Self::get_config_from_editor`]
    /// to open an editor to ask the user to write a temp config file.
    #[arg(value_name = "PATH")]
    #[arg(value_parser = PathBufValueParser::new().try_map(Self::parse_config_from_filepath))]
    pub config: Option<Config>,

    /// Keep tag sets and progress in this directory instead of the configured one.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log more, can be repeated (`-v` info, `-vv` debug, `-vvv` trace).
    ///
    /// `RUST_LOG` takes precedence when it is set.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    #[inline]
    fn parse_config(content: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(content)?;
        config.validate()?;
        Ok(config)
    }

    #[inline]
    fn parse_config_from_filepath(path: PathBuf) -> anyhow::Result<Config> {
        Self::parse_config(&std::fs::read_to_string(path)?)
    }

    /// The config to run with, after applying the command line overrides.
    ///
    /// Falls back to [`Self::get_config_from_editor`] when no config file was given.
    ///
    /// # Errors
    ///
    /// See [`Self::get_config_from_editor`].
    pub fn resolve_config(&mut self, cmd: &mut Command) -> Result<Config, clap::Error> {
        let mut config = match self.config.take() {
            Some(config) => config,
            None => Self::get_config_from_editor(cmd)?,
        };
        if let Some(data_dir) = self.data_dir.take() {
            config.data_dir = data_dir;
        }
        Ok(config)
    }

    /// Open an editor to ask the user to write a config file.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use booru_curator::cli::{Cli, CommandFactory as _};
    ///
    /// let config = Cli::get_config_from_editor(&mut Cli::command())?;
    ///
    /// Ok::<(), clap::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// If the editor fails to write, or the content is empty, or the content is invalid,
    /// it will return an error.
    pub fn get_config_from_editor(cmd: &mut Command) -> Result<Config, clap::Error> {
        let config = Editor::new()
            .extension(EDITOR_EXTENSION)
            .edit(DEFAULT_CONFIG_STR)
            .map_err(|err| cmd.error(ErrorKind::Io, err))?
            .ok_or_else(|| {
                cmd.error(
                    ErrorKind::ValueValidation,
                    "Empty content. Maybe you forget to save in the editor?",
                )
            })?;

        Self::parse_config(&config).map_err(|err| cmd.error(ErrorKind::ValueValidation, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_config() {
        let config = Cli::parse_config(DEFAULT_CONFIG_STR).unwrap();
        assert_eq!(config.download_dir, PathBuf::from("saved"));

        assert!(Cli::parse_config("data_dir = 1").is_err());
    }

    #[test]
    fn test_data_dir_override() {
        let config_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(config_file.path(), DEFAULT_CONFIG_STR).unwrap();

        let mut cli = Cli::try_parse_from([
            std::ffi::OsStr::new("booru-curator"),
            config_file.path().as_os_str(),
            std::ffi::OsStr::new("--data-dir"),
            std::ffi::OsStr::new("elsewhere"),
            std::ffi::OsStr::new("-vv"),
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);

        let config = cli.resolve_config(&mut Cli::command()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("elsewhere"));
    }
}
