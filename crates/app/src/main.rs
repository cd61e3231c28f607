use chrono::Utc;
use clap::{Parser, Subcommand};
use paper_rag_core::{
    digest_file, discover_finding_files, discover_source_files, process_batch,
    read_finding_payloads, Bot, BotConfig, ChatModel, ConversationHistory, Embedder,
    ExtractionClient, ExtractionConfig, HashEmbedder, HttpChatModel, HttpEmbedder,
    ProcessorOptions, Retriever, VectorStore, DEFAULT_HISTORY_WINDOW,
};
use paper_rag_core::write_findings_jsonl;
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "paper-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Vector store path
    #[arg(long, default_value = "findings.db")]
    db: String,

    /// Remote embedding endpoint; the deterministic local embedder is used when unset.
    #[arg(long, env = "EMBEDDING_ENDPOINT")]
    embedding_url: Option<String>,

    /// Embedding model name
    #[arg(long, default_value = "text-embedding")]
    embedding_model: String,

    /// Embedding dimensionality (must match the store)
    #[arg(long, default_value = "256")]
    embedding_dimensions: usize,

    /// Streaming chat completions endpoint
    #[arg(long, env = "CHAT_ENDPOINT")]
    chat_url: Option<String>,

    /// Chat model name
    #[arg(long, default_value = "chat-model")]
    chat_model: String,

    /// Display name of the assistant
    #[arg(long, default_value = "Research Assistant")]
    bot_name: String,

    /// Persona description injected into the system prompt
    #[arg(
        long,
        default_value = "an expert reader of the indexed scientific literature"
    )]
    persona: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run structured-findings extraction over a folder of PDFs.
    Extract {
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        folder: String,
        /// Directory for the produced findings JSONL files.
        #[arg(long)]
        out_dir: String,
    },
    /// Ingest findings JSONL files into the vector store.
    Ingest {
        /// Folder that contains findings JSONL files recursively.
        #[arg(long)]
        findings: String,
    },
    /// Retrieve the findings most similar to a query.
    Search {
        /// Search query
        #[arg(long)]
        query: String,
        /// Number of findings to return.
        #[arg(long, default_value = "5")]
        top_k: usize,
    },
    /// Chat over the indexed findings, streaming the answer.
    Chat {
        /// One-shot question; an interactive session starts when omitted.
        question: Option<String>,
        /// Conversation history file
        #[arg(long, default_value = ".chat_history.json")]
        history: String,
        /// Commit an interrupted reply to history anyway.
        #[arg(long, default_value_t = false)]
        append_partial: bool,
        /// Number of findings retrieved per question.
        #[arg(long, default_value = "4")]
        top_k: usize,
        /// Minimum similarity for a finding to be used as context.
        #[arg(long, default_value = "0.6")]
        min_similarity: f32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "paper-rag boot"
    );

    match &cli.command {
        Command::Extract { folder, out_dir } => {
            let config = ExtractionConfig::from_env()
                .ok_or_else(|| anyhow::anyhow!("EXTRACTION_ENDPOINT is not set"))?;
            let client = ExtractionClient::new(config)
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            let files = discover_source_files(Path::new(folder), "pdf");
            if files.is_empty() {
                anyhow::bail!("no pdf files found in {folder}");
            }
            fs::create_dir_all(out_dir)?;

            let mut seen = HashSet::new();
            let mut written = 0usize;
            let mut skipped = 0usize;

            for path in files {
                let digest =
                    digest_file(&path).map_err(|error| anyhow::anyhow!(error.to_string()))?;
                if !seen.insert(digest) {
                    info!(path = %path.display(), "duplicate content, skipping");
                    skipped += 1;
                    continue;
                }

                match client.extract_findings(&path).await {
                    Ok(records) => {
                        let stem = path
                            .file_stem()
                            .and_then(|name| name.to_str())
                            .unwrap_or("paper");
                        let out_path = Path::new(out_dir).join(format!("{stem}_findings.jsonl"));
                        write_findings_jsonl(&out_path, &records)
                            .map_err(|error| anyhow::anyhow!(error.to_string()))?;

                        info!(path = %path.display(), findings = records.len(), out = %out_path.display(), "paper extracted");
                        written += 1;
                    }
                    Err(error) => {
                        warn!(path = %path.display(), %error, "extraction failed, skipping");
                        skipped += 1;
                    }
                }
            }

            println!(
                "{written} papers extracted, {skipped} skipped at {}",
                Utc::now().to_rfc3339()
            );
        }
        Command::Ingest { findings } => {
            let embedder = build_embedder(&cli)?;
            let mut store = VectorStore::open(Path::new(&cli.db), embedder.dimensions())
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            let files = discover_finding_files(Path::new(findings));
            if files.is_empty() {
                anyhow::bail!("no findings jsonl files found in {findings}");
            }

            let options = ProcessorOptions::default();
            let mut total = 0usize;

            for path in &files {
                let payloads = read_finding_payloads(path)
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?;
                let label = path
                    .file_stem()
                    .and_then(|name| name.to_str())
                    .unwrap_or("findings");

                let report = process_batch(&payloads, &mut store, &embedder, label, &options)
                    .await
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?;

                for skipped in &report.skipped {
                    warn!(file = %path.display(), index = skipped.index, reason = %skipped.reason, "payload skipped");
                }
                for failed in &report.failed {
                    warn!(file = %path.display(), chunk = %failed.id, reason = %failed.reason, "chunk failed");
                }

                total += report.ingested;
            }

            store
                .close()
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            println!(
                "{total} chunks ingested from {} files at {}",
                files.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Search { query, top_k } => {
            let embedder = build_embedder(&cli)?;
            let store = VectorStore::open(Path::new(&cli.db), embedder.dimensions())
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let retriever = Retriever::new(store, embedder);

            let hits = retriever
                .retrieve(query, *top_k)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            if hits.is_empty() {
                println!("no matching findings");
            }
            for hit in hits {
                println!(
                    "[{:.4}] {} ({})",
                    hit.similarity, hit.record.source_document, hit.record.metadata.finding_type
                );
                println!("  {}", hit.record.text);
            }
        }
        Command::Chat {
            question,
            history,
            append_partial,
            top_k,
            min_similarity,
        } => {
            let chat_url = cli.chat_url.clone().ok_or_else(|| {
                anyhow::anyhow!("chat endpoint is required (set --chat-url or CHAT_ENDPOINT)")
            })?;

            let mut chat_model = HttpChatModel::new(&chat_url, &cli.chat_model)
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            if let Ok(api_key) = std::env::var("CHAT_API_KEY") {
                if !api_key.trim().is_empty() {
                    chat_model = chat_model.with_api_key(api_key);
                }
            }

            let embedder = build_embedder(&cli)?;
            let store = VectorStore::open(Path::new(&cli.db), embedder.dimensions())
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            let config = BotConfig {
                name: cli.bot_name.clone(),
                persona: cli.persona.clone(),
                top_k: *top_k,
                min_similarity: *min_similarity,
                history_window: DEFAULT_HISTORY_WINDOW,
                append_partial: *append_partial,
            };

            let mut bot = Bot::new(
                Retriever::new(store, embedder),
                chat_model,
                ConversationHistory::open(history, DEFAULT_HISTORY_WINDOW),
                config,
            );

            match question {
                Some(question) => stream_answer(&mut bot, question, &cli.bot_name).await?,
                None => {
                    let stdin = io::stdin();
                    let mut line = String::new();
                    loop {
                        print!("you> ");
                        io::stdout().flush()?;

                        line.clear();
                        if stdin.lock().read_line(&mut line)? == 0 {
                            break;
                        }
                        let question = line.trim();
                        if question.is_empty() {
                            continue;
                        }
                        if question == "exit" || question == "quit" {
                            break;
                        }

                        stream_answer(&mut bot, question, &cli.bot_name).await?;
                    }
                }
            }
        }
    }

    Ok(())
}

fn build_embedder(cli: &Cli) -> anyhow::Result<Box<dyn Embedder>> {
    match &cli.embedding_url {
        Some(endpoint) => {
            let mut embedder =
                HttpEmbedder::new(endpoint, &cli.embedding_model, cli.embedding_dimensions)
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            if let Ok(api_key) = std::env::var("EMBEDDING_API_KEY") {
                if !api_key.trim().is_empty() {
                    embedder = embedder.with_api_key(api_key);
                }
            }
            Ok(Box::new(embedder))
        }
        None => Ok(Box::new(HashEmbedder {
            dimensions: cli.embedding_dimensions,
        })),
    }
}

async fn stream_answer<E: Embedder, M: ChatModel>(
    bot: &mut Bot<E, M>,
    question: &str,
    bot_name: &str,
) -> anyhow::Result<()> {
    let mut stream = bot
        .get_response(question)
        .await
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;

    print!("{bot_name}> ");
    io::stdout().flush()?;

    while let Some(token) = stream.next_token().await {
        match token {
            Ok(token) => {
                print!("{token}");
                io::stdout().flush()?;
            }
            Err(error) => {
                println!();
                warn!(%error, "generation stream failed");
                break;
            }
        }
    }
    println!();

    Ok(())
}
