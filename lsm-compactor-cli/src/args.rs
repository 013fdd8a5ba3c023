use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lsm-compactor")]
#[command(version = "0.1.0")]
#[command(about, long_about = None)]
pub(crate) struct CliArgs {
    #[arg(
        short,
        long,
        help = "A .env file to use to supply environment variables"
    )]
    pub(crate) env_file: Option<String>,
    #[arg(
        short,
        long,
        help = "The path in the object store to the root directory of the db, starting from within the object store bucket"
    )]
    pub(crate) path: String,

    #[command(subcommand)]
    pub(crate) command: CliCommands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub(crate) enum CliCommands {
    /// Reads the latest manifest file and outputs a readable
    /// String representation
    ReadManifest {
        /// Specify a specific manifest id to read, if this is
        /// not specified the latest manifest will be returned
        #[arg(short, long)]
        id: Option<u64>,
    },

    /// Lists all available manifests
    ListManifests {
        /// Optionally specify a start id for the range of manifests to lookup
        #[arg(short, long)]
        start: Option<u64>,

        /// Optionally specify an end id for the range of manifests to lookup
        #[arg(short, long)]
        end: Option<u64>,
    },

    /// Runs a size-tiered compactor against the db until interrupted
    RunCompactor {
        /// A json, toml or yaml file holding the compactor settings. Without it the
        /// settings are layered from Compactor.{json,toml,yaml,yml} in the working
        /// directory and COMPACTOR_ environment variables.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overrides how often the manifest is polled, in a human-friendly format
        /// such as "5s" or "1min 30s"
        #[arg(long)]
        #[clap(value_parser = humantime::parse_duration)]
        poll_interval: Option<Duration>,

        /// Overrides the maximum number of compactions running at once
        #[arg(long)]
        max_concurrent_compactions: Option<usize>,
    },
}

/// The manifest id range covered by the optional, exclusive `end`.
pub(crate) fn manifest_range(start: Option<u64>, end: Option<u64>) -> Range<u64> {
    start.unwrap_or(u64::MIN)..end.unwrap_or(u64::MAX)
}

pub(crate) fn parse_args() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use clap::Parser;
    use rstest::rstest;

    use crate::args::{manifest_range, CliArgs, CliCommands};

    #[rstest]
    #[case(&["read-manifest"], CliCommands::ReadManifest { id: None })]
    #[case(&["read-manifest", "--id", "7"], CliCommands::ReadManifest { id: Some(7) })]
    #[case(
        &["list-manifests", "-s", "2", "-e", "5"],
        CliCommands::ListManifests { start: Some(2), end: Some(5) }
    )]
    #[case(
        &["run-compactor"],
        CliCommands::RunCompactor { config: None, poll_interval: None, max_concurrent_compactions: None }
    )]
    #[case(
        &["run-compactor", "-c", "Compactor.toml", "--poll-interval", "1min 30s", "--max-concurrent-compactions", "2"],
        CliCommands::RunCompactor {
            config: Some(PathBuf::from("Compactor.toml")),
            poll_interval: Some(Duration::from_secs(90)),
            max_concurrent_compactions: Some(2),
        }
    )]
    fn test_parse_commands(#[case] command: &[&str], #[case] expected: CliCommands) {
        let args = ["lsm-compactor", "--path", "/db"]
            .iter()
            .chain(command.iter());

        let parsed = CliArgs::try_parse_from(args).unwrap();

        assert_eq!(parsed.path, "/db");
        assert_eq!(parsed.command, expected);
    }

    #[rstest]
    #[case(&["run-compactor", "--poll-interval", "soon"])]
    #[case(&["read-manifest", "--id", "latest"])]
    #[case(&["compact-everything"])]
    fn test_reject_invalid_commands(#[case] command: &[&str]) {
        let args = ["lsm-compactor", "--path", "/db"]
            .iter()
            .chain(command.iter());

        assert!(CliArgs::try_parse_from(args).is_err());
    }

    #[test]
    fn test_requires_path() {
        assert!(CliArgs::try_parse_from(["lsm-compactor", "read-manifest"]).is_err());
    }

    #[rstest]
    #[case(None, None, u64::MIN..u64::MAX)]
    #[case(Some(3), None, 3..u64::MAX)]
    #[case(None, Some(9), u64::MIN..9)]
    #[case(Some(3), Some(9), 3..9)]
    fn test_manifest_range(
        #[case] start: Option<u64>,
        #[case] end: Option<u64>,
        #[case] expected: std::ops::Range<u64>,
    ) {
        assert_eq!(manifest_range(start, end), expected);
    }
}
