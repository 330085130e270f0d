use anyhow::Result;
use log::info;

use sml_ingest::cli::{build_cli, handle_subcommands, init_logging, run_fleet};
use sml_ingest::config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let cli_level = matches.get_one::<String>("log-level").cloned();

    if !matches!(matches.subcommand(), None | Some(("run", _))) {
        init_logging(cli_level.as_deref().unwrap_or("info"));
        handle_subcommands(&matches).await?;
        return Ok(());
    }

    let path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let config = Config::from_file(path)?;
    init_logging(cli_level.as_deref().unwrap_or(&config.general.log_level));

    info!("🖥️  sml-ingest {} starting with {}", sml_ingest::VERSION, path);
    run_fleet(&config).await
}
