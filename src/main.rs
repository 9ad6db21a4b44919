use anyhow::Context;
use candle_serve::build_app;
use candle_serve::config::{resolve_config_path, AppSettings};
use candle_serve::engine_state::EngineHolder;
use candle_serve::openai::pipelines::llm_engine::LLMEngine;
use candle_serve::openai::pipelines::pipeline::DefaultLoader;
use candle_serve::openai::OpenAIServerData;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file. Falls back to `config/config.yaml.sample` when missing.
    #[arg(long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Overrides `server.host`
    #[arg(long)]
    host: Option<String>,

    /// Overrides `server.port`
    #[arg(long)]
    port: Option<u16>,

    /// Overrides `model.model_path`
    #[arg(long)]
    model_path: Option<String>,
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config_path, is_fallback) = resolve_config_path(&args.config);
    let mut settings = AppSettings::load(&config_path)
        .with_context(|| format!("loading settings from {}", config_path.display()))?;
    if let Some(model_path) = args.model_path {
        settings = settings.with_model_path(model_path);
    }
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    init_tracing(&settings.log.level);
    if is_fallback {
        warn!(
            "{} not found, using {}",
            args.config.display(),
            config_path.display()
        );
    }
    info!(
        model = %settings.model.model_path,
        device = %settings.model.device,
        precision = %settings.model.precision,
        "Loading model"
    );

    let holder = EngineHolder::new();
    let model_settings = settings.model.clone();
    let log_settings = settings.log.clone();
    let loader_holder = holder.clone();
    tokio::task::spawn_blocking(move || {
        loader_holder.initialize(|| {
            let pipeline = DefaultLoader::new(&model_settings)
                .load(&model_settings.device, &model_settings.precision)?;
            info!("Model {} is loaded", pipeline.name());
            Ok(LLMEngine::new(Arc::new(pipeline), log_settings))
        })
    })
    .await??;

    let data = Arc::new(OpenAIServerData::new(
        holder.clone(),
        settings.server.served_model_names.clone(),
    ));
    let app = build_app(data, &settings.server, &settings.cors)?;

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    warn!(
        "Server started at http://{addr}{}/v1/",
        settings.server.root_path.trim_end_matches('/')
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    holder.shutdown();
    Ok(())
}
