//! Command-line flags shared by `rsv-recovery` and `rsv-emergency`.

use crate::config::RecoveryConfig;
use crate::error::Result;
use clap::{Arg, ArgAction, ArgMatches};
use std::path::PathBuf;

pub fn global_args() -> Vec<Arg> {
    vec![
        Arg::new("config")
            .help("JSON configuration file")
            .long("config")
            .global(true),
        Arg::new("data-dir")
            .help("Data store directory")
            .long("data-dir")
            .global(true),
        Arg::new("backup-dir")
            .help("Snapshot directory")
            .long("backup-dir")
            .global(true),
        Arg::new("log-dir")
            .help("Directory for db-recovery.log")
            .long("log-dir")
            .global(true),
        Arg::new("json-logs")
            .help("Emit JSON log lines")
            .long("json-logs")
            .global(true)
            .action(ArgAction::SetTrue),
    ]
}

/// Configuration resolved from the file, environment and flags.
pub struct Resolved {
    pub config: RecoveryConfig,
    pub config_file: Option<PathBuf>,
    pub json_logs: bool,
}

impl Resolved {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let config_file = matches.get_one::<String>("config").map(PathBuf::from);
        let mut config = RecoveryConfig::load(config_file.as_deref())?;

        if let Some(dir) = matches.get_one::<String>("data-dir") {
            config.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = matches.get_one::<String>("backup-dir") {
            config.paths.backup_dir = PathBuf::from(dir);
        }
        if let Some(dir) = matches.get_one::<String>("log-dir") {
            config.paths.log_dir = PathBuf::from(dir);
        }

        Ok(Self {
            config,
            config_file,
            json_logs: matches.get_flag("json-logs"),
        })
    }

    /// Flags that make a worker process see the same configuration.
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(file) = &self.config_file {
            args.push("--config".to_string());
            args.push(file.display().to_string());
        }
        let paths = &self.config.paths;
        for (flag, dir) in [
            ("--data-dir", &paths.data_dir),
            ("--backup-dir", &paths.backup_dir),
            ("--log-dir", &paths.log_dir),
        ] {
            args.push(flag.to_string());
            args.push(dir.display().to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Command;

    fn command() -> Command {
        Command::new("test")
            .args(global_args())
            .subcommand(Command::new("check"))
    }

    #[test]
    fn test_flags_override_defaults() {
        let matches = command()
            .try_get_matches_from(["test", "check", "--backup-dir", "/srv/backups", "--json-logs"])
            .unwrap();
        let resolved = Resolved::from_matches(&matches).unwrap();
        assert_eq!(resolved.config.paths.backup_dir, PathBuf::from("/srv/backups"));
        assert!(resolved.json_logs);
        assert!(resolved.config_file.is_none());
    }

    #[test]
    fn test_worker_args_carry_paths() {
        let matches = command()
            .try_get_matches_from([
                "test",
                "--data-dir",
                "/d",
                "--backup-dir",
                "/b",
                "--log-dir",
                "/l",
                "check",
            ])
            .unwrap();
        let resolved = Resolved::from_matches(&matches).unwrap();
        assert_eq!(
            resolved.worker_args(),
            vec!["--data-dir", "/d", "--backup-dir", "/b", "--log-dir", "/l"]
        );
    }
}
