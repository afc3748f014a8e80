use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use vimap_config::{ConfigLoader, VimapConfig};
use vimap_pool::{worker_main, WorkerOptions, WorkerSpec};

mod builtins;
mod cli;
mod commands;

use cli::{Cli, Commands, ConfigCommands};
use commands::{parse_init, run_command, RunOptions};

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<VimapConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                info!("Loading configuration from: {:?}", path);
                loader
                    .from_file(path)
                    .context(format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => {
            debug!("No configuration file specified. Loading from environment or defaults.");
            loader
                .from_env()
                .context("Failed to load configuration from environment")
        }
    }
}

/// Handle configuration validation
fn handle_config_validate(config_file: &PathBuf) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {:?}",
            config_file
        ));
    }

    match load_config(Some(config_file)) {
        Ok(_config) => {
            println!("Configuration file is valid");
            info!("Configuration validation passed");
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {:#}", e);
            error!("Configuration validation failed: {:#}", e);
            Err(e)
        }
    }
}

/// Handle configuration generation
fn handle_config_generate(output: &PathBuf, force: bool) -> Result<()> {
    info!("Generating configuration at: {:?}", output);

    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }

    fs::write(output, VimapConfig::generate_sample()).context("Failed to write configuration file")?;

    println!("Configuration generated at: {:?}", output);
    println!("Validate with: vimap config validate --config-file {:?}", output);

    Ok(())
}

/// Handle configuration display
fn handle_config_show(config_file: Option<&PathBuf>, format: &str) -> Result<()> {
    info!("Showing configuration (format: {})", format);

    let config = load_config(config_file)?;

    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            let yaml_output = serde_yaml::to_string(&config).context("Failed to serialize to YAML")?;
            println!("{}", yaml_output);
        }
        "json" => {
            let json_output =
                serde_json::to_string_pretty(&config).context("Failed to serialize to JSON")?;
            println!("{}", json_output);
        }
        _ => {
            return Err(anyhow::anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    }

    Ok(())
}

fn handle_transforms() {
    for (name, summary) in builtins::BUILTINS {
        println!("{:<12} {}", name, summary);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle worker mode first; stdout belongs to the pipe protocol
    if let Some(Commands::Worker {
        worker_id,
        transform,
        init_args,
        init_kwargs,
        poll_interval_ms,
    }) = &cli.command
    {
        vimap_logging::init_worker_logging(cli.log_level.as_deref())?;

        let (init_args, init_kwargs) = parse_init(init_args, init_kwargs)?;
        let options = WorkerOptions {
            worker_id: *worker_id,
            spec: WorkerSpec {
                transform: transform.clone(),
                init_args,
                init_kwargs,
            },
            poll_interval: Duration::from_millis(*poll_interval_ms),
        };

        let code = worker_main(options, builtins::registry()).await;
        std::process::exit(code);
    }

    let mut config = load_config(cli.config.as_ref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    }
    vimap_logging::init_logging(&config.logging)?;

    debug!("Vimap CLI starting");

    match cli.command {
        Some(Commands::Run {
            transform,
            workers,
            input,
            json,
            init_args,
            init_kwargs,
            eager,
        }) => {
            let options = RunOptions {
                transform,
                workers,
                input,
                json,
                init_args,
                init_kwargs,
                eager,
                log_level: cli.log_level.clone(),
            };
            run_command(config, options).await
        }
        Some(Commands::Transforms) => {
            handle_transforms();
            Ok(())
        }
        Some(Commands::Config { config_cmd }) => match config_cmd {
            ConfigCommands::Validate { config_file } => handle_config_validate(&config_file),
            ConfigCommands::Generate { output, force } => handle_config_generate(&output, force),
            ConfigCommands::Show {
                config_file,
                format,
            } => handle_config_show(config_file.as_ref(), &format),
        },
        // Handled above
        Some(Commands::Worker { .. }) => Ok(()),
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
