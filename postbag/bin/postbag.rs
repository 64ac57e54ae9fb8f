#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;
use postbag::controller::Postbag;

/// Batch email dispatcher
#[derive(Parser, Debug)]
#[command(name = "postbag", version, about, long_about = None)]
struct Cli {
    /// Configuration file; searched for in the default locations when omitted
    #[arg(short, long, env = "POSTBAG_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) if path.exists() => path,
        Some(path) => anyhow::bail!("Configuration file does not exist: {}", path.display()),
        None => find_config_file()?,
    };
    let postbag = Postbag::from_file(&config_path)?;

    if cli.check {
        postbag.validate()?;
        println!("{} is valid", config_path.display());
        return Ok(());
    }

    let runtime = postbag.runtime.build()?;
    runtime.block_on(postbag.run())
}

/// Find the configuration file using the following precedence:
/// 1. ./postbag.config.ron (current working directory)
/// 2. /etc/postbag/postbag.config.ron (system-wide config)
///
/// `POSTBAG_CONFIG` is handled by the `--config` flag.
fn find_config_file() -> anyhow::Result<PathBuf> {
    let default_paths = [
        PathBuf::from("./postbag.config.ron"),
        PathBuf::from("/etc/postbag/postbag.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config / POSTBAG_CONFIG\n{paths_tried}"
    )
}
