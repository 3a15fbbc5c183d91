use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tutor_core::{
    AgentStatus, CancellationToken, Config, ConfigLoader, EventCollector, GraphExtractor,
    ImageAttachment, KnowledgeGraph, ProblemContext, SolutionLogInput, StageEvent,
    TelemetryOptions, TextbookSource, TraceCollector, init_telemetry, log_solution,
    persist_trace,
};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(
    name = "tutor-cli",
    version,
    about = "Textbook-grounded GCSE answers via Librarian, Solver and Examiner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Solve one problem against local textbook sources.
    Solve(SolveArgs),
    /// Extract a curriculum knowledge graph (concepts and their links) as JSON.
    ExtractGraph(ExtractGraphArgs),
    /// Validate configuration and report the resolved settings.
    CheckConfig(CheckConfigArgs),
}

#[derive(Args, Debug)]
struct SolveArgs {
    /// Problem text. May be omitted when at least one image is given.
    #[arg(long, default_value = "")]
    problem: String,

    /// Textbook source file or directory (repeatable).
    #[arg(long = "source", required = true)]
    sources: Vec<PathBuf>,

    /// Only read the top level of source directories.
    #[arg(long)]
    shallow: bool,

    /// Image of the problem (repeatable); MIME type is guessed from the extension.
    #[arg(long = "image")]
    images: Vec<PathBuf>,

    /// Path to a TOML config (defaults to `TUTOR_CONFIG`, then `tutor.toml`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the solution as JSON instead of Markdown.
    #[arg(long)]
    json: bool,

    /// Write the stage trace as JSON into this directory.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Print a Mermaid flowchart of the stage trace after the solution.
    #[arg(long)]
    explain: bool,

    /// Append the solution to the JSONL solution log.
    #[arg(long)]
    log_solutions: bool,
}

#[derive(Args, Debug)]
struct ExtractGraphArgs {
    /// Textbook source file or directory (repeatable).
    #[arg(long = "source", required = true)]
    sources: Vec<PathBuf>,

    /// Only read the top level of source directories.
    #[arg(long)]
    shallow: bool,

    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the graph JSON to this file instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CheckConfigArgs {
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Solve(args) => solve_command(args).await?,
            Command::ExtractGraph(args) => extract_graph_command(args).await?,
            Command::CheckConfig(args) => check_config_command(args)?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = ConfigLoader::load_or_default(path)?;
    init_telemetry(TelemetryOptions::default().with_default_level(&config.logging.level))?;
    Ok(config)
}

async fn solve_command(args: SolveArgs) -> Result<()> {
    let config = load_config(args.config.clone())?;

    let sources = collect_sources(&args.sources, !args.shallow)?;
    let images = args
        .images
        .iter()
        .map(|path| load_image(path))
        .collect::<Result<Vec<_>>>()?;
    if sources.is_empty() {
        bail!("no readable textbook text found under the given --source paths");
    }

    let source_labels: Vec<String> = sources
        .iter()
        .map(|source| source.source_label.clone())
        .collect();
    let image_count = images.len();
    info!(
        sources = sources.len(),
        images = image_count,
        model = %config.model.model,
        "starting solve"
    );

    let context = ProblemContext {
        problem_text: args.problem.clone(),
        images,
        textbook_sources: sources,
    };

    let (events, receiver) = EventCollector::new();
    let coordinator = config.build_coordinator()?.with_events(events);
    let model = coordinator.model_id().to_string();
    let watcher = tokio::spawn(watch_progress(receiver));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling request");
            interrupt.cancel();
        }
    });

    let outcome = coordinator.solve_with_report(&context, &cancel).await;
    // Dropping the coordinator closes the event channel so the watcher finishes.
    drop(coordinator);
    let trace = watcher.await.context("progress watcher panicked")?;
    let report = outcome?;

    if let Some(dir) = &args.trace_dir {
        let path = persist_trace(dir, &report.request_id, trace.events())?;
        info!(path = %path.display(), "trace persisted");
    }

    if args.log_solutions {
        let input = SolutionLogInput::from_report(
            &report,
            model,
            &args.problem,
            source_labels,
            image_count,
        );
        let path = log_solution(input, config.logging.solution_log_dir.as_deref())?;
        info!(path = %path.display(), "solution logged");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.solution)?);
    } else {
        println!("{}", report.solution.render_markdown());
    }

    if args.explain {
        println!("{}", trace.summary().render_mermaid());
    }

    Ok(())
}

/// Follow stage events until the channel closes, logging status changes.
async fn watch_progress(mut receiver: UnboundedReceiver<StageEvent>) -> TraceCollector {
    let mut board = AgentStatus::board();
    let mut trace = TraceCollector::new();
    while let Some(event) = receiver.recv().await {
        trace.record(&event);
        for status in board.iter_mut().filter(|status| status.role == event.role()) {
            status.apply(&event);
            info!(role = %status.role, status = ?status.status, "{}", status.message);
        }
    }
    trace
}

async fn extract_graph_command(args: ExtractGraphArgs) -> Result<()> {
    let config = load_config(args.config.clone())?;
    let sources = collect_sources(&args.sources, !args.shallow)?;
    if sources.is_empty() {
        bail!("no readable textbook text found under the given --source paths");
    }

    let extractor = GraphExtractor::new(config.build_generator()?)
        .with_max_chars(config.pipeline.max_grounding_chars);
    let graph = extractor.extract(&sources).await?;
    if graph.is_empty() {
        warn!("no curriculum concepts were extracted");
    }
    info!(
        entities = graph.entities.len(),
        relationships = graph.relationships.len(),
        "knowledge graph extracted"
    );

    match write_graph(&graph, args.output.as_deref())? {
        Some(path) => info!(path = %path.display(), "knowledge graph written"),
        None => println!("{}", serde_json::to_string_pretty(&graph)?),
    }
    Ok(())
}

/// Persist `graph` as pretty JSON when an output path is given.
fn write_graph(graph: &KnowledgeGraph, output: Option<&Path>) -> Result<Option<PathBuf>> {
    let Some(path) = output else {
        return Ok(None);
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let payload = serde_json::to_vec_pretty(graph)?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write knowledge graph {}", path.display()))?;
    Ok(Some(path.to_path_buf()))
}

fn check_config_command(args: CheckConfigArgs) -> Result<()> {
    let config = load_config(args.config)?;
    println!("provider: {}", config.model.provider);
    println!("model: {}", config.model.model);
    println!("max grounding chars: {}", config.pipeline.max_grounding_chars);
    match config.pipeline.stage_timeout_ms {
        Some(ms) => println!("stage timeout: {ms} ms"),
        None => println!("stage timeout: none"),
    }
    match config.api_key() {
        Ok(_) => println!("api key: {} is set", config.model.api_key_env),
        Err(err) => {
            warn!(%err, "api key missing");
            println!("api key: {} is NOT set", config.model.api_key_env);
        }
    }
    Ok(())
}

fn collect_sources(paths: &[PathBuf], recursive: bool) -> Result<Vec<TextbookSource>> {
    let mut sources = Vec::new();
    for path in paths {
        if !path.exists() {
            bail!("source path {} does not exist", path.display());
        }
        let entries: Box<dyn Iterator<Item = PathBuf>> = if path.is_file() {
            Box::new(std::iter::once(path.to_path_buf()))
        } else {
            let walker = WalkDir::new(path)
                .min_depth(0)
                .max_depth(if recursive { usize::MAX } else { 1 })
                .sort_by_file_name();
            Box::new(
                walker
                    .into_iter()
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_type().is_file())
                    .map(|entry| entry.into_path()),
            )
        };

        for file in entries {
            let text = match fs::read_to_string(&file) {
                Ok(text) => text,
                Err(err) => {
                    warn!(path = %file.display(), %err, "skipping unreadable source");
                    continue;
                }
            };
            if text.trim().is_empty() {
                continue;
            }
            sources.push(TextbookSource::new(source_label(&file), text));
        }
    }
    Ok(sources)
}

fn source_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn load_image(path: &Path) -> Result<ImageAttachment> {
    let payload =
        fs::read(path).with_context(|| format!("failed to read image {}", path.display()))?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() != mime_guess::mime::IMAGE {
        warn!(path = %path.display(), mime = %mime, "attachment does not look like an image");
    }
    Ok(ImageAttachment::new(payload, mime.essence_str()))
}
