use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use parley_core::config::{Config, LoggingConfig};
use parley_gateway::{GatewayState, Pipeline, TurnSettings};
use parley_media::{ElevenLabsSynthesizer, SpeechSynthesizer};
use parley_providers::{Credentials, LlmProvider, OpenAiProvider};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Real-time voice-agent gateway: transcripts in, streamed replies and speech out",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Gateway {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Query a running gateway's health endpoint
    Status {
        /// Gateway port (default: from config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Gateway { port } => run_gateway(config, port).await?,
        Commands::Status { port } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            println!("Parley v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            match reqwest::get(format!("http://127.0.0.1:{port}/health")).await {
                Ok(resp) => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("Gateway: running on port {port}");
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
                Err(_) => println!("Gateway: not running on port {port}"),
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&redacted(&config))?);
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK ({})", config_path.display());
            }
        },
    }

    Ok(())
}

/// Copy of the config with inline secrets masked.
fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if let Some(llm) = config.llm.as_mut() {
        if llm.api_key.is_some() {
            llm.api_key = Some("***".into());
        }
    }
    if let Some(tts) = config.tts.as_mut() {
        if tts.api_key.is_some() {
            tts.api_key = Some("***".into());
        }
    }
    config
}

fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut directives = vec![level];
        if let Some(logging) = logging {
            directives.extend(logging.filters.iter().cloned());
        }
        EnvFilter::new(directives.join(","))
    });

    let json = logging.is_some_and(|l| l.format == "json");
    let stdout = logging.is_some_and(|l| l.output == "stdout");

    let registry = tracing_subscriber::registry().with(filter);
    match (json, stdout) {
        (true, true) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stdout))
            .init(),
        (true, false) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        (false, true) => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
            .init(),
        (false, false) => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn build_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    let (provider, credentials) = match &config.llm {
        Some(llm) => (
            OpenAiProvider::from_config(llm)?,
            Credentials::from_key(llm.resolve_api_key()),
        ),
        None => (OpenAiProvider::openai(None), Credentials::None),
    };
    let llm: Arc<dyn LlmProvider> = Arc::new(provider);

    let tts = match &config.tts {
        Some(tts) if tts.provider == "elevenlabs" => {
            let synth: Arc<dyn SpeechSynthesizer> = Arc::new(ElevenLabsSynthesizer::from_config(tts)?);
            Some(synth)
        }
        Some(tts) => anyhow::bail!("Unknown TTS provider: {}", tts.provider),
        None => None,
    };

    Ok(Pipeline {
        llm,
        credentials,
        tts,
        settings: TurnSettings::from_config(config),
    })
}

async fn run_gateway(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        tracing::warn!("{w}");
    }
    if !errors.is_empty() {
        for e in &errors {
            tracing::error!("{e}");
        }
        anyhow::bail!("Invalid configuration");
    }

    let port = port.unwrap_or_else(|| config.gateway_port());
    let pipeline = build_pipeline(&config)?;
    tracing::info!(
        llm = pipeline.llm.id(),
        model = %pipeline.settings.model,
        tts = pipeline.tts.as_ref().map(|t| t.id()).unwrap_or("none"),
        "Starting Parley gateway on port {port}"
    );

    let state = GatewayState::new(Arc::new(config), Arc::new(pipeline));
    #[cfg(feature = "metrics")]
    let state = state.with_prometheus(parley_gateway::metrics::install_prometheus_recorder()?);

    parley_gateway::start_gateway(Arc::new(state), port).await
}
