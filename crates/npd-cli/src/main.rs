#![deny(clippy::all, warnings)]

use clap::error::ErrorKind;
use clap::Parser;
use color_eyre::Result;
use tracing::error;

use npd_core::{run_prefetch, OsFileSystem, PrefetchOptions, RunEnvironment};

mod cli;

use cli::NpdCli;

fn main() -> Result<()> {
    color_eyre::install()?;

    if cfg!(windows) {
        eprintln!("nix-prefetch-pnpm-deps supports Unix hosts only.");
        std::process::exit(1);
    }

    let cli = match NpdCli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            err.print()?;
            std::process::exit(code);
        }
    };
    init_tracing(cli.quiet, cli.verbose);

    let environment = RunEnvironment::capture();
    let print_hash = cli.hash.is_none();
    let opts = PrefetchOptions {
        src_dir: cli.source_dir,
        fetcher_version: cli.fetcher_version,
        pnpm_path: cli.pnpm_path,
        workspaces: cli.workspaces,
        pnpm_flags: cli.pnpm_flags,
        pre_install_commands: cli.pre_install_commands,
        expected_hash: cli.hash,
    };

    match run_prefetch(&OsFileSystem::new(), &environment, &opts) {
        Ok(hash) => {
            if print_hash {
                println!("{hash}");
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("DEBUG reached err branch: {err}");
            error!("{}", render_error_chain(&err));
            eprintln!("DEBUG after error! call");
            std::process::exit(1);
        }
    }
}

fn init_tracing(quiet: bool, verbose: u8) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("npd_cli={level},npd_core={level},npd_domain={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let res = tracing::subscriber::set_global_default(subscriber);
    eprintln!("DEBUG set_global_default: {res:?}");
}

/// Render an error and its `source()` chain the way the log consumer
/// expects: the message first, one `caused by:` line per cause.
fn render_error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(&format!("\ncaused by: {cause}"));
        source = cause.source();
    }
    rendered
}
