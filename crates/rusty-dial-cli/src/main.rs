use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use rusty_dial_core::config::{Config, LoggingConfig, expand_path};
use rusty_dial_gateway::GatewayState;
use rusty_dial_media::call::Collaborators;
use rusty_dial_media::pipeline::FallbackAudio;
use rusty_dial_media::stt::WhisperStt;
use rusty_dial_media::tts_stream::ElevenLabsTts;
use rusty_dial_providers::anthropic::AnthropicBackend;
use rusty_dial_providers::openai::OpenAiBackend;
use rusty_dial_providers::{ReasoningBackend, VoiceConfig};

#[derive(Parser)]
#[command(
    name = "rusty-dial",
    about = "Real-time voice call agent: telephony media in, spoken responses out",
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
    Serve {
        /// Port to listen on (default: 8302)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show live calls of a running gateway
    Status,

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
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

/// Filter directives: a base level followed by per-crate overrides.
fn log_directives(logging: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level.to_string())
        .chain(logging.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_directives(logging, verbose))?,
    };
    let writer = match logging.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
    let result = match logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

/// Build the production adapters from the providers section.
fn collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let providers = config.providers();
    let reasoning = providers
        .reasoning
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("No reasoning provider configured"))?;
    let stt = providers
        .stt
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("No STT provider configured"))?;
    let tts = providers
        .tts
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("No TTS provider configured"))?;

    let voice = VoiceConfig {
        voice: tts.voice.clone(),
        model: tts.model.clone(),
        language: stt.language.clone(),
    };
    let settings = config.call_settings()?;
    let reasoning: Arc<dyn ReasoningBackend> = match reasoning.provider.as_str() {
        "anthropic" => Arc::new(AnthropicBackend::from_config(reasoning)?),
        _ => Arc::new(OpenAiBackend::from_config(reasoning)?),
    };

    Ok(Collaborators {
        reasoning,
        stt: Arc::new(WhisperStt::from_config(stt)?),
        tts: Arc::new(ElevenLabsTts::from_config(tts)?),
        voice,
        fallback: Arc::new(FallbackAudio::new(settings.fallback_text.clone())),
    })
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let base = format!("http://127.0.0.1:{}", config.gateway_port());
    println!("Rusty Dial v{}", env!("CARGO_PKG_VERSION"));
    println!("Gateway: {base}");

    let health = match reqwest::get(format!("{base}/health")).await {
        Ok(resp) => resp.json::<serde_json::Value>().await?,
        Err(_) => {
            println!("Status: not running");
            return Ok(());
        }
    };
    println!("Status: {}", health["status"].as_str().unwrap_or("unknown"));
    println!("Live calls: {}/{}", health["live_calls"], health["max_concurrent"]);

    let listed: serde_json::Value = reqwest::get(format!("{base}/calls")).await?.json().await?;
    if let Some(calls) = listed["data"]["calls"].as_array() {
        for call in calls {
            println!(
                "  {}  {:<8}  {:<12}  {} -> {}",
                call["call_id"].as_str().unwrap_or("?"),
                call["direction"].as_str().unwrap_or("?"),
                call["state"].as_str().unwrap_or("?"),
                call["from"].as_str().unwrap_or(""),
                call["to"].as_str().unwrap_or(""),
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose)?;

    match cli.command {
        Commands::Serve { port } => {
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                anyhow::bail!("Invalid configuration: {}", errors.join("; "));
            }

            if let Some(port) = port {
                config.gateway.get_or_insert_with(Default::default).port = port;
            }
            let port = config.gateway_port();
            let collaborators = collaborators(&config)?;
            let state = Arc::new(GatewayState::new(config, collaborators)?);

            tracing::info!(config = %config_path.display(), "Starting Rusty Dial gateway on port {port}");
            rusty_dial_gateway::start_gateway(state, port).await?;
        }
        Commands::Status => status(&config).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}
