use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use rag_chat_engine::config::{Cli, Command, Config};
use rag_chat_engine::engine::{EngineManager, ProgressEvent, ProgressSink};
use rag_chat_engine::gpu::device::SystemHost;
use rag_chat_engine::gpu::probe::check_accelerated_backend;
use rag_chat_engine::retrieval::RetrievalResult;
use rag_chat_engine::runtime::local::LocalLoader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Logs go to stderr so stdout carries only the answer.
    let filter = if cli.verbose {
        "rag_chat_engine=debug,rag_chat=debug"
    } else {
        "rag_chat_engine=info,rag_chat=info"
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("rag-chat-engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Arc::new(Config::load(&cli.config)?);

    info!(
        model_id = config.model.model_id,
        context_window = config.model.context_window_size,
        max_tokens = config.generation.max_tokens,
        temperature = config.generation.temperature,
        worker = config.worker.enabled,
        "Configuration loaded"
    );

    match cli.command {
        Command::Probe => {
            let available = check_accelerated_backend(&SystemHost::default()).await;
            info!(available, "Accelerated backend probe");
            println!("accelerated backend: {}", if available { "available" } else { "unavailable" });
        }
        Command::Ask {
            question,
            context,
            retrieval,
        } => {
            let retrieval = match retrieval {
                Some(path) => RetrievalResult::load(&path)?,
                None => RetrievalResult {
                    context,
                    ..RetrievalResult::default()
                },
            };
            let context = retrieval.context();
            if context.is_empty() {
                warn!("Empty context; the model has nothing to answer from");
            }

            if !check_accelerated_backend(&SystemHost::default()).await {
                info!("No accelerated backend detected, continuing anyway");
            }

            let engine = EngineManager::new(config.clone(), Arc::new(LocalLoader));
            let progress: ProgressSink = Arc::new(|event: ProgressEvent| {
                info!(percent = event.percent, "{}", event.message);
            });
            engine.init(Some(progress)).await?;

            let mut stdout = std::io::stdout();
            let mut print_token = |fragment: &str| {
                let _ = stdout.write_all(fragment.as_bytes());
                let _ = stdout.flush();
            };
            engine.generate(&context, &question, Some(&mut print_token)).await?;
            println!();

            if !retrieval.sources.is_empty() {
                println!("\nSources:");
                for citation in &retrieval.sources {
                    println!("  - {} ({})", citation.source, citation.section);
                }
            }
            if !retrieval.chunks.is_empty() {
                println!("\nContext:");
                for chunk in &retrieval.chunks {
                    println!(
                        "  [{}] {} / {}: {}",
                        chunk.score_percent(),
                        chunk.source,
                        chunk.section,
                        chunk.content
                    );
                }
            }
        }
    }

    Ok(())
}
