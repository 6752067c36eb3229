use std::{net::SocketAddr, path::PathBuf};

use clap::{ArgAction, Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "fencelock", version, about, long_about = None)]
pub struct Cli {
    /// TOML config file; flags and environment override its values
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address the HTTP server listens on
    #[arg(short, long, env = "FENCELOCK_BIND_ADDR")]
    pub bind: Option<SocketAddr>,

    /// Lease duration granted by acquire, heartbeat and value updates
    #[arg(long, env = "FENCELOCK_LEASE_DURATION_SECS", value_name = "SECS")]
    pub lease_duration_secs: Option<u64>,

    /// Storage backend
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// SQLite database file (implies the sqlite backend)
    #[arg(long, env = "FENCELOCK_DATABASE", value_name = "FILE")]
    pub database: Option<PathBuf>,

    /// SQLite table holding lease records
    #[arg(long)]
    pub table: Option<String>,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Memory,
    Sqlite,
}

impl Cli {
    /// Default log filter for the `-v` count; `RUST_LOG` takes precedence.
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "fencelock=debug,fence=debug,info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "fencelock",
            "--bind",
            "127.0.0.1:9000",
            "--lease-duration-secs",
            "10",
            "--backend",
            "sqlite",
            "--database",
            "/tmp/leases.db",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.bind, Some("127.0.0.1:9000".parse::<SocketAddr>().unwrap()));
        assert_eq!(cli.lease_duration_secs, Some(10));
        assert_eq!(cli.backend, Some(BackendKind::Sqlite));
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/leases.db")));
        assert_eq!(cli.verbosity, 2);
        assert_eq!(cli.log_filter(), "debug");
    }

    #[test]
    fn test_rejects_bad_bind_address() {
        assert!(Cli::try_parse_from(["fencelock", "--bind", "not-an-addr"]).is_err());
    }
}
