use std::path::PathBuf;

use clap::{ArgAction, Parser};

use npd_domain::FetcherVersion;

#[derive(Parser, Debug)]
#[command(
    name = "nix-prefetch-pnpm-deps",
    author,
    version,
    about = "Prefetch a pnpm project's dependencies and emit the fixed-output SRI hash of the store"
)]
pub struct NpdCli {
    #[arg(value_name = "SOURCE_DIR", help = "Directory containing pnpm-lock.yaml")]
    pub source_dir: PathBuf,

    #[arg(
        long,
        value_name = "VERSION",
        help = "pnpm fetcher version (1, 2, or 3)",
        long_help = "pnpm fetcher version\nAvailable versions:\n\
                     \t1: First version. Here to preserve backwards compatibility\n\
                     \t2: Ensure consistent permissions in the hashed store\n\
                     \t3: Build a reproducible tarball around the store"
    )]
    pub fetcher_version: FetcherVersion,

    #[arg(
        long,
        value_name = "PATH",
        help = "Path to the pnpm executable (PATH is searched otherwise)"
    )]
    pub pnpm_path: Option<PathBuf>,

    #[arg(
        long = "workspace",
        value_name = "FILTER",
        help = "Restrict the install to specific workspaces (repeatable, pnpm --filter syntax)"
    )]
    pub workspaces: Vec<String>,

    #[arg(
        long = "pnpm-flag",
        value_name = "FLAG",
        allow_hyphen_values = true,
        help = "Additional flag passed to pnpm install verbatim (repeatable)"
    )]
    pub pnpm_flags: Vec<String>,

    #[arg(
        long = "pre-install-command",
        value_name = "COMMAND",
        allow_hyphen_values = true,
        help = "Shell command run in the source directory before pnpm install (repeatable)"
    )]
    pub pre_install_commands: Vec<String>,

    #[arg(
        long,
        value_name = "SRI",
        help = "Expected hash of the fetched dependencies; a mismatch fails the run"
    )]
    pub hash: Option<String>,

    #[arg(short, long, help = "Suppress non-error output")]
    pub quiet: bool,

    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
}
