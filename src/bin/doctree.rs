//! CLI binary for edgequake-doctree.
//!
//! A thin shim over the library crate: `detect` proposes chapters from a
//! style stream, `run` converts approved chapters into one editor document.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_doctree::persist::write_atomic;
use edgequake_doctree::{
    detect_chapters, rules::seed_curated, ChapterUnit, Collaborators, DocumentJob,
    FileStateStore, HeaderCriteria, JsonFixtureSource, LlmOracleConfig, LlmRuleOracle,
    Orchestrator, PipelineConfig, PipelineProgressCallback, ProgressCallback, Rerun,
    RuleRegistry, SchemaRegistry, SharedRegistry, Stage, StyleEntry,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Renders one bar over the approved chapters plus a log line per finished
/// chapter. Chapters finish out of order when run concurrently.
struct CliProgressCallback {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, document_id: &str, chapters: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} chapters  \
                 ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(chapters as u64);
        self.bar.set_prefix("Converting");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{document_id}: {chapters} approved chapters"))
        ));
    }

    fn on_stage(&self, chapter_id: &str, stage: Stage) {
        self.bar.set_message(format!("{chapter_id} {}", dim(stage.as_str())));
    }

    fn on_chapter_complete(&self, chapter_id: &str, nodes: usize, needs_review: usize) {
        let review = if needs_review == 0 {
            String::new()
        } else {
            cyan(&format!("  {needs_review} to review"))
        };
        self.bar.println(format!(
            "  {} {:<32} {}{}",
            green("✓"),
            chapter_id,
            dim(&format!("{nodes:>5} nodes")),
            review
        ));
        self.bar.inc(1);
    }

    fn on_chapter_failed(&self, chapter_id: &str, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} {:<32} {}", red("✗"), chapter_id, red(&msg)));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, _document_id: &str, combined: usize, failed: usize) {
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!("{} {} chapters combined", green("✔"), bold(&combined.to_string()));
        } else {
            eprintln!(
                "{} {} chapters combined  ({} failed)",
                cyan("⚠"),
                bold(&combined.to_string()),
                red(&failed.to_string())
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Propose chapters from a style stream (review, then set "approval": "approved")
  doctree detect --style book.style.json --pages 240 > chapters.json

  # Convert the approved chapters
  doctree run --schema tiptap.json --rules rules.json --streams streams/ \
              --chapters chapters.json --state state/ -o book.json

  # Resume after an interruption: same command, finished stages are skipped
  # Re-run two chapters from scratch
  doctree run ... --rerun chapter_3_Results,chapter_4_Discussion

  # Deterministic run with curated and stored rules only
  doctree run ... --no-oracle

STREAMS DIRECTORY:
  <chapter_id>.content.json   ordered content entries of the chapter
  <chapter_id>.style.json     style entries (optional; missing means unstyled)

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
"#;

/// Convert PDF extraction streams into schema-valid editor documents.
#[derive(Parser, Debug)]
#[command(
    name = "doctree",
    version,
    about = "Convert PDF extraction streams into schema-valid Tiptap/ProseMirror documents",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCTREE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCTREE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert approved chapters and combine them into one document.
    Run(RunArgs),
    /// Propose chapter boundaries from a style stream.
    Detect(DetectArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Editor schema descriptor (JSON).
    #[arg(long, env = "DOCTREE_SCHEMA")]
    schema: PathBuf,

    /// Rule registry file. Created on first run; saved after every run.
    #[arg(long, env = "DOCTREE_RULES", default_value = "rules.json")]
    rules: PathBuf,

    /// Directory of pre-extracted content/style streams.
    #[arg(long, env = "DOCTREE_STREAMS")]
    streams: PathBuf,

    /// Chapter list (JSON array, as printed by `doctree detect`).
    #[arg(long, env = "DOCTREE_CHAPTERS")]
    chapters: PathBuf,

    /// Directory for persisted pipeline state.
    #[arg(long, env = "DOCTREE_STATE", default_value = "state")]
    state: PathBuf,

    /// Document identifier. Default: the chapter file's stem.
    #[arg(long)]
    document_id: Option<String>,

    /// Re-run chapters from scratch: `all` or a comma-separated list of ids.
    #[arg(long)]
    rerun: Option<String>,

    /// Never ask the oracle; unmatched units become fallback nodes.
    #[arg(long, env = "DOCTREE_NO_ORACLE")]
    no_oracle: bool,

    /// Leave heading levels as converted; skip the cross-chapter typography check.
    #[arg(long)]
    no_typography: bool,

    /// Chapters processed at once.
    #[arg(short, long, env = "DOCTREE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Per-stage deadline in seconds.
    #[arg(long, env = "DOCTREE_STAGE_TIMEOUT", default_value_t = 300)]
    stage_timeout: u64,

    /// Per-proposal oracle deadline in seconds.
    #[arg(long, env = "DOCTREE_ORACLE_TIMEOUT", default_value_t = 60)]
    oracle_timeout: u64,

    /// Minimum bbox overlap for a style entry to join a content entry.
    #[arg(long, default_value_t = 0.5)]
    overlap: f64,

    /// LLM model ID for the oracle.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider for the oracle: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Retries per oracle call.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Write the combined document here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep node metadata (provenance, review flags) in the output.
    #[arg(long)]
    with_meta: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCTREE_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct DetectArgs {
    /// Style stream of the whole document (JSON array of style entries).
    #[arg(long)]
    style: PathBuf,

    /// Total page count of the document.
    #[arg(long)]
    pages: u32,

    /// Header font family (case-insensitive).
    #[arg(long)]
    font: Option<String>,

    /// Header font size (±5%).
    #[arg(long)]
    size: Option<f64>,

    /// Extra header pattern (regex); repeatable. Replaces the built-in set.
    #[arg(long = "pattern")]
    patterns: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs would interleave with the progress bar.
    let show_progress = match &cli.command {
        Command::Run(args) => !cli.quiet && !args.no_progress,
        Command::Detect(_) => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Run(args) => run(args, show_progress, cli.quiet).await,
        Command::Detect(args) => detect(args).await,
    }
}

async fn run(args: RunArgs, show_progress: bool, quiet: bool) -> Result<()> {
    let schema = Arc::new(
        SchemaRegistry::load(&args.schema)
            .with_context(|| format!("Failed to load schema {:?}", args.schema))?,
    );

    let mut rules = RuleRegistry::open(&args.rules, &schema)
        .with_context(|| format!("Failed to open rule registry {:?}", args.rules))?;
    let seeded = seed_curated(&mut rules, &schema).context("Failed to seed curated rules")?;
    if seeded > 0 && !quiet {
        eprintln!("{} {} curated rules added", dim("·"), seeded);
    }
    let registry = SharedRegistry::new(rules);

    let raw = tokio::fs::read_to_string(&args.chapters)
        .await
        .with_context(|| format!("Failed to read chapters from {:?}", args.chapters))?;
    let chapters: Vec<ChapterUnit> =
        serde_json::from_str(&raw).context("Chapter file is not a JSON array of chapters")?;

    let document_id = match &args.document_id {
        Some(id) => id.clone(),
        None => file_stem(&args.chapters)?,
    };

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&args, progress)?;

    let source = Arc::new(JsonFixtureSource::new(&args.streams));
    let mut orchestrator = Orchestrator::new(
        config,
        schema,
        registry.clone(),
        Collaborators::from_source(source),
        Arc::new(FileStateStore::new(&args.state)),
    );
    if !args.no_oracle {
        let oracle = LlmRuleOracle::from_config(LlmOracleConfig {
            model: args.model.clone(),
            provider_name: args.provider.clone(),
            max_retries: args.max_retries,
            ..Default::default()
        })
        .context("Failed to set up the rule oracle (use --no-oracle to run without one)")?;
        orchestrator = orchestrator.with_oracle(Arc::new(oracle));
    }

    let rerun = parse_rerun(args.rerun.as_deref());
    let job = DocumentJob::new(document_id, chapters).with_rerun(rerun);
    let doc = orchestrator.run(job).await.context("Pipeline run failed")?;

    // Usage tallies and synthesised rules survive even when chapters failed.
    registry
        .read()
        .save(&args.rules)
        .with_context(|| format!("Failed to save rule registry {:?}", args.rules))?;

    let root = if args.with_meta {
        doc.root.clone()
    } else {
        doc.root.without_meta()
    };
    let json = serde_json::to_string_pretty(&root).context("Failed to serialise document")?;

    match &args.output {
        Some(path) => {
            write_atomic(path, json.as_bytes())
                .with_context(|| format!("Failed to write {:?}", path))?;
            if !quiet {
                eprintln!(
                    "{}  {} chapters  {} repairs  {} to review  →  {}",
                    if doc.failed.is_empty() { green("✔") } else { cyan("⚠") },
                    doc.chapters.len(),
                    doc.manifest.repair_count(),
                    doc.manifest.needs_review.len(),
                    bold(&path.display().to_string()),
                );
            }
        }
        None => println!("{json}"),
    }

    if !quiet && !doc.manifest.diagnostics.is_empty() {
        for d in &doc.manifest.diagnostics {
            eprintln!("  {} {}", dim("·"), d);
        }
    }
    Ok(())
}

async fn detect(args: DetectArgs) -> Result<()> {
    let raw = tokio::fs::read_to_string(&args.style)
        .await
        .with_context(|| format!("Failed to read style stream {:?}", args.style))?;
    let entries: Vec<StyleEntry> =
        serde_json::from_str(&raw).context("Style file is not a JSON array of style entries")?;

    let mut criteria = HeaderCriteria::default();
    if let Some(font) = args.font {
        criteria = criteria.with_font(font);
    }
    if let Some(size) = args.size {
        criteria = criteria.with_size(size);
    }
    if !args.patterns.is_empty() {
        criteria = criteria
            .with_patterns(&args.patterns)
            .context("Invalid header pattern")?;
    }

    let chapters = detect_chapters(&entries, args.pages, &criteria);
    if chapters.is_empty() {
        bail!("No chapter headers found in {:?}", args.style);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&chapters).context("Failed to serialise chapters")?
    );
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(args: &RunArgs, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .concurrency(args.concurrency)
        .stage_timeout_secs(args.stage_timeout)
        .oracle_timeout_secs(args.oracle_timeout)
        .overlap_threshold(args.overlap)
        .typography_check(!args.no_typography);
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

/// Parse `--rerun`: absent, `all`, or comma-separated chapter ids.
fn parse_rerun(s: Option<&str>) -> Rerun {
    match s.map(str::trim) {
        None | Some("") => Rerun::None,
        Some(s) if s.eq_ignore_ascii_case("all") => Rerun::All,
        Some(s) => Rerun::Chapters(
            s.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect(),
        ),
    }
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(String::from)
        .with_context(|| format!("Cannot derive a document id from {:?}", path))
}
