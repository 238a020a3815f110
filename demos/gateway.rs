use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tieline_gw::{
    actions,
    config::{self, GatewayConfig},
    host::{InstanceStatus, LogHost, OptionValues},
    instance::{GatewayInstance, InstanceState},
    matrix,
};

const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

#[derive(Parser, Debug)]
#[command()]
struct Cli {
    #[clap(long)]
    #[arg(global = true, default_value_t = false)]
    verbose: bool,

    /// json config file; command line values override it
    #[clap(long)]
    #[arg(global = true)]
    config: Option<String>,

    #[clap(long)]
    #[arg(global = true)]
    host: Option<String>,

    #[clap(long)]
    #[arg(global = true)]
    username: Option<String>,

    #[clap(long)]
    #[arg(global = true)]
    password: Option<String>,

    #[clap(long)]
    #[arg(global = true)]
    port: Option<u16>,

    #[clap(long)]
    #[arg(global = true, default_value_t = false)]
    https: bool,

    /// seconds to wait for the connection
    #[clap(long)]
    #[arg(global = true, default_value_t = DEFAULT_CONNECT_TIMEOUT)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and keep the session alive until interrupted
    Run {},
    /// Print discovered matrix features
    Features {},
    /// Route source to destination
    Route { source: String, destination: String },
    /// Clear route of destination
    Clear { destination: String },
    /// Recall matrix preset
    Preset { preset: String },
    /// Send raw api request
    Request {
        #[clap(long)]
        #[arg(default_value_t = String::from("POST"))]
        method: String,
        path: String,
        body: Option<String>,
    },
    /// Store effective settings as json
    SaveConfig { path: String },
    /// Print config form description
    ConfigFields {},
}

fn build_config(cli: &Cli) -> Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(username) = &cli.username {
        config.username = username.clone();
    }
    if let Some(password) = &cli.password {
        config.password = password.clone();
    }
    if cli.port.is_some() {
        config.port = cli.port;
    }
    if cli.https {
        config.use_https = true;
    }
    Ok(config)
}

async fn wait_connected(instance: &GatewayInstance, timeout: Duration) -> Result<InstanceState> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = instance.state().await?;
        match state.status {
            InstanceStatus::Ok => return Ok(state),
            InstanceStatus::BadConfig => anyhow::bail!("invalid configuration"),
            _ => {}
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!(
                "not connected after {:?} (status {}, {} reconnect attempts)",
                timeout,
                state.status,
                state.reconnect_attempts
            );
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn options(pairs: &[(&str, &str)]) -> OptionValues {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    if let Commands::SaveConfig { path } = &cli.command {
        config.validate()?;
        return config::save_config(path, &config);
    }

    let instance = GatewayInstance::spawn(Arc::new(LogHost));
    instance.init(config)?;
    let state = wait_connected(&instance, Duration::from_secs(cli.timeout)).await?;
    log::info!("connected, nonce count {:?}", state.nonce_count);

    match cli.command {
        Commands::Run {} => {
            tokio::signal::ctrl_c().await?;
        }
        Commands::Features {} => {
            for kind in [matrix::SOURCES, matrix::DESTINATIONS, matrix::PRESETS] {
                let choices = instance.get_variable_choices(kind).await?;
                println!(
                    "{}: {}",
                    kind,
                    choices.iter().map(|c| c.label.as_str()).collect::<Vec<_>>().join(", ")
                );
            }
            let matrix = instance.matrix_variables().await?;
            let others: Vec<_> = matrix
                .iter()
                .filter(|(k, _)| ![matrix::SOURCES, matrix::DESTINATIONS, matrix::PRESETS].contains(k))
                .collect();
            for (kind, values) in others {
                println!("{}: {}", kind, values.join(", "));
            }
        }
        Commands::Route {
            source,
            destination,
        } => {
            instance
                .execute_action(
                    actions::ROUTE_SOURCE,
                    options(&[("source", source.as_str()), ("destination", destination.as_str())]),
                )
                .await?;
        }
        Commands::Clear { destination } => {
            instance
                .execute_action(actions::CLEAR_ROUTE, options(&[("destination", destination.as_str())]))
                .await?;
        }
        Commands::Preset { preset } => {
            instance
                .execute_action(actions::RECALL_PRESET, options(&[("preset", preset.as_str())]))
                .await?;
        }
        Commands::Request { method, path, body } => {
            let body = body.unwrap_or_default();
            instance
                .execute_action(
                    actions::CUSTOM_REQUEST,
                    options(&[("method", method.as_str()), ("path", path.as_str()), ("body", body.as_str())]),
                )
                .await?;
        }
        Commands::SaveConfig { .. } | Commands::ConfigFields {} => {}
    }
    instance.destroy().await
}

fn main() {
    let cli = Cli::parse();

    let log_level = {
        if cli.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        }
    };
    env_logger::Builder::new()
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_line_number(true)
        .format_file(true)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    if let Commands::ConfigFields {} = cli.command {
        match serde_json::to_string_pretty(&config::config_fields()) {
            Ok(s) => println!("{}", s),
            Err(e) => log::error!("{:?}", e),
        }
        return;
    }

    if let Err(e) = run(cli) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
