//! Config command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use classync_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "api_url": config.api_url,
                    "api_token_set": config.api_token.is_some(),
                    "sync_enabled": config.sync_enabled,
                    "sync_interval_secs": config.sync_interval_secs,
                    "request_timeout_secs": config.request_timeout_secs,
                    "backoff_base_ms": config.backoff_base_ms,
                    "backoff_cap_secs": config.backoff_cap_secs,
                    "max_attempts": config.max_attempts,
                    "shutdown_grace_secs": config.shutdown_grace_secs,
                    "page_size": config.page_size,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:             {}", config.data_dir.display());
            println!(
                "  api_url:              {}",
                config.api_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  api_token:            {}",
                if config.api_token.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!("  sync_enabled:         {}", config.sync_enabled);
            println!("  sync_interval_secs:   {}", config.sync_interval_secs);
            println!("  request_timeout_secs: {}", config.request_timeout_secs);
            println!("  backoff_base_ms:      {}", config.backoff_base_ms);
            println!("  backoff_cap_secs:     {}", config.backoff_cap_secs);
            println!("  max_attempts:         {}", config.max_attempts);
            println!("  shutdown_grace_secs:  {}", config.shutdown_grace_secs);
            println!("  page_size:            {}", config.page_size);
            println!(
                "  log_file:             {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: &str, value: &str, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    config.set_value(key, value)?;

    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "api_token" { "********" } else { value };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}
