//! 🚀 bndl: the front door, the bouncer, the maitre d' of the bundle relay.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that loads config,
//! sets up logging, and then lets the library do the heavy lifting.
//! Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 📦 Relay `eth_sendBundle` bundles into S3.
#[derive(Debug, Parser)]
#[command(name = "bndl", version, about)]
struct Cli {
    /// 🔧 TOML config file. Optional: env vars alone are enough to boot.
    #[arg(short, long, env = "BNDL_CONFIG")]
    config: Option<PathBuf>,
}

/// 📡 RUST_LOG if set, otherwise LOG_LEVEL=debug turns on debug, otherwise info.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let the_level = match std::env::var("LOG_LEVEL") {
            Ok(level) if level.eq_ignore_ascii_case("debug") => "debug",
            _ => "info",
        };
        EnvFilter::new(the_level)
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 Set up tracing, because println! debugging is a lifestyle choice
    // we're trying to move past, like flip phones and cargo shorts
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();

    let the_cli = Cli::parse();

    // 🔒 Validate the config file exists before we get too emotionally attached
    if let Some(path) = &the_cli.config {
        let the_file_is_there = path.try_exists().with_context(|| {
            format!(
                "💀 Couldn't check whether the config file exists. Maybe it's an issue with \
                 pwd/cwd and relative paths; an absolute path removes the guesswork. Was checking here: '{}'",
                path.display()
            )
        })?;
        if !the_file_is_there {
            anyhow::bail!("💀 No config file at '{}'. Drop --config to run from env vars alone.", path.display());
        }
    }

    // 🔧 Load the config: the moment we find out if someone put a tab where a space should be
    let the_config = bndl::app_config::load_config(the_cli.config.as_deref())
        .context("💀 In bndl, main, we couldn't load the configuration. Check the file and the env vars.")?;

    // 🚀 SEND IT.
    let the_result = bndl::run(the_config).await;

    if let Err(err) = the_result {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("Address already in use")
                || cause_str.contains("address already in use")
                || cause_str.contains("Permission denied")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }

        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: the listener couldn't take its port. Check server.bind_addr \
                 (BNDL_SERVER__BIND_ADDR) and whether another bndl is still running: `ss -ltnp`. ☕"
            );
        }

        // 🗑️ Exit with prejudice. Process exitus maximus.
        std::process::exit(1);
    }

    // ✅ If we got here, someone pressed ctrl-c and everything drained. 🍾
    Ok(())
}
