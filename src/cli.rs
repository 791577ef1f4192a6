use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::io::SpoolMode;

#[derive(Parser, Debug)]
#[command(name = "ipa-server")]
#[command(version)]
#[command(about = "Parse and store iOS and Android packages for over-the-air distribution", long_about = None)]
#[command(after_help = "Examples:\n  \
  ipa-server inspect Demo.ipa                         print package metadata\n  \
  ipa-server inspect https://example.com/app.apk      inspect a remote package via Range requests\n  \
  ipa-server add Demo.ipa --storage ./upload          store a package\n  \
  ipa-server listen --storage ./upload                accept remote uploads")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// More logging (-vv => trace)
    #[arg(short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Less logging (-qq => errors only)
    #[arg(short = 'q', global = true, action = clap::ArgAction::Count)]
    pub quiet: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the metadata of a package as JSON
    Inspect {
        /// Package path or HTTP URL
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Stream a package through the upload pipeline into storage
    Add {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        store: StoreArgs,

        /// Where the upload is buffered while it is parsed
        #[arg(long, value_enum, default_value_t = Spool::Memory)]
        spool: Spool,
    },

    /// Accept remote uploads: one JSON-lines bridge session per connection
    Listen {
        #[arg(long, env = "IPA_SERVER_ADDR", default_value = "127.0.0.1:8080")]
        addr: String,

        #[command(flatten)]
        store: StoreArgs,

        /// Give up on a silent peer after this many seconds
        #[arg(long, value_name = "SECS")]
        deadline: Option<u64>,
    },
}

#[derive(clap::Args, Debug)]
pub struct StoreArgs {
    /// Storage directory
    #[arg(long, env = "IPA_SERVER_STORAGE", value_name = "DIR")]
    pub storage: PathBuf,

    /// Public base URL of the storage directory; enables install manifests
    #[arg(long, env = "IPA_SERVER_PUBLIC_URL", value_name = "URL")]
    pub public_url: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Spool {
    Memory,
    Disk,
}

impl From<Spool> for SpoolMode {
    fn from(spool: Spool) -> Self {
        match spool {
            Spool::Memory => SpoolMode::Memory,
            Spool::Disk => SpoolMode::Disk,
        }
    }
}

pub fn is_http_url(file: &str) -> bool {
    file.starts_with("http://") || file.starts_with("https://")
}

impl Cli {
    /// Default log directive from `-v`/`-q`; `RUST_LOG` takes precedence.
    pub fn log_level(&self) -> &'static str {
        match (self.verbose as i16) - (self.quiet as i16) {
            i16::MIN..=-2 => "error",
            -1 => "warn",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::parse_from(["ipa-server", "-v", "inspect", "https://x.example.com/a.ipa"]);
        assert_eq!(cli.log_level(), "debug");
        match cli.command {
            Command::Inspect { file } => assert!(is_http_url(&file)),
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::parse_from([
            "ipa-server", "add", "Demo.ipa", "--storage", "/srv/upload", "--spool", "disk", "-qq",
        ]);
        assert_eq!(cli.log_level(), "error");
        match cli.command {
            Command::Add { file, store, spool } => {
                assert_eq!(file, PathBuf::from("Demo.ipa"));
                assert_eq!(store.storage, PathBuf::from("/srv/upload"));
                assert_eq!(SpoolMode::from(spool), SpoolMode::Disk);
            }
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::parse_from([
            "ipa-server", "listen", "--storage", "/srv/upload", "--addr", "0.0.0.0:9000", "--deadline", "30",
        ]);
        match cli.command {
            Command::Listen { addr, deadline, .. } => {
                assert_eq!(addr, "0.0.0.0:9000");
                assert_eq!(deadline, Some(30));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_storage_is_required() {
        if std::env::var_os("IPA_SERVER_STORAGE").is_none() {
            assert!(Cli::try_parse_from(["ipa-server", "add", "Demo.ipa"]).is_err());
        }
        assert!(!is_http_url("Demo.ipa"));
    }
}
