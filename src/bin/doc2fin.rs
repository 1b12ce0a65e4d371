//! CLI binary for doc2fin.
//!
//! A thin shim over the library crate: `serve` runs the webhook listener,
//! `analyze` runs one document through the pipeline from the terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use doc2fin::{
    AnalysisConfig, AnalysisOutcome, AnalysisProgressCallback, DocumentAnalysisHandler,
    ProgressCallback, Stage,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::net::SocketAddr;
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

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a spinner showing the current stage, with a
/// log line per finished stage.
struct CliProgressCallback {
    bar: ProgressBar,
    done: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(Stage::ALL.len() as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:24.green/238}] {pos}/{len}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix("Analysing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            done: AtomicUsize::new(0),
        })
    }
}

impl AnalysisProgressCallback for CliProgressCallback {
    fn on_run_start(&self, document_id: &str) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Analysing document {document_id}…"))
        ));
    }

    fn on_stage_start(&self, _document_id: &str, stage: Stage) {
        self.bar.set_message(stage.label());
    }

    fn on_stage_complete(&self, _document_id: &str, stage: Stage, elapsed_ms: u64) {
        self.done.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {:<28}  {}",
            green("✓"),
            stage.label(),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, _document_id: &str, total_ms: u64) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} analysis completed in {}",
            green("✔"),
            bold(&format!("{:.1}s", total_ms as f64 / 1000.0))
        );
    }

    fn on_run_failed(&self, _document_id: &str, stage: Stage, error: &str) {
        self.bar.finish_and_clear();
        let msg = if error.chars().count() > 100 {
            format!("{}\u{2026}", error.chars().take(99).collect::<String>())
        } else {
            error.to_string()
        };
        eprintln!(
            "{} {} failed after {} stages: {}",
            red("✘"),
            stage.label(),
            self.done.load(Ordering::SeqCst),
            red(&msg)
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Listen for database webhooks on port 3000
  doc2fin serve --port 3000

  # Analyse one document by id
  doc2fin analyze 7f0c1c52-2c1e-4a55-9d3c-1b0e7d6a9f10

  # Structured output
  doc2fin analyze 42 --json > result.json

  # Simulate a webhook against a running server
  curl -X POST localhost:3000/api -H 'content-type: application/json' \
       -d '{"type":"INSERT","record":{"id":"42"}}'

ENVIRONMENT VARIABLES:
  SUPABASE_URL                 Storage project URL (required)
  SUPABASE_SERVICE_ROLE_KEY    Storage service-role key (required)
  GOOGLE_CLOUD_VISION_API_KEY  Cloud Vision API key
  DOCUMENTAI_PROJECT_ID        Document AI project  ┐
  DOCUMENTAI_LOCATION          Document AI region   │
  DOCUMENTAI_PROCESSOR_ID      Document AI processor├ use Document AI instead
  GOOGLE_ACCESS_TOKEN          OAuth bearer token   │ of Cloud Vision
  GOOGLE_SERVICE_ACCOUNT       Service-account JSON │
  GOOGLE_APPLICATION_CREDENTIALS  Key file path     ┘
  DOC2FIN_EXTRACTOR            Force backend: vision | documentai
  OPENAI_API_KEY               OpenAI API key (default provider)
  DOC2FIN_PROVIDER             Override provider (openai, anthropic, gemini, ollama)
  DOC2FIN_MODEL                Override model ID (default gpt-4o-mini)

  Secrets also accept <NAME>_FILE (path) and <NAME>_BASE64 forms.
  A .env file in the working directory is loaded if present.
"#;

/// Extract condominium financial figures from uploaded documents.
#[derive(Parser, Debug)]
#[command(
    name = "doc2fin",
    version,
    about = "Extract condominium financial figures from uploaded documents",
    long_about = "Webhook service that reads condominium financial statements with OCR and an LLM \
and stores the extracted figures as structured rows.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// LLM model ID (default gpt-4o-mini).
    #[arg(long, global = true, env = "DOC2FIN_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "DOC2FIN_PROVIDER")]
    provider: Option<String>,

    /// Per-call timeout for storage, extraction and inference, in seconds.
    #[arg(long, global = true, env = "DOC2FIN_CALL_TIMEOUT")]
    call_timeout: Option<u64>,

    /// File download timeout in seconds.
    #[arg(long, global = true, env = "DOC2FIN_DOWNLOAD_TIMEOUT")]
    download_timeout: Option<u64>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOC2FIN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOC2FIN_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for database webhooks.
    Serve {
        /// Address to bind.
        #[arg(long, env = "DOC2FIN_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Port to bind.
        #[arg(short, long, env = "PORT", default_value_t = 3000)]
        port: u16,
    },

    /// Analyse one document by id and exit.
    Analyze {
        /// Document id (the `id` column of the documents table).
        document_id: String,

        /// Print the outcome as JSON on stdout.
        #[arg(long)]
        json: bool,

        /// Disable the progress bar.
        #[arg(long, env = "DOC2FIN_NO_PROGRESS")]
        no_progress: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs for interactive `analyze` runs.
    let show_progress = match &cli.command {
        Command::Analyze {
            json, no_progress, ..
        } => !cli.quiet && !no_progress && !json,
        Command::Serve { .. } => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;

    match cli.command {
        Command::Serve { ref host, port } => {
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("Invalid listen address {host}:{port}"))?;
            let handler = DocumentAnalysisHandler::from_config(config)
                .context("Failed to initialise the analysis handler")?;
            doc2fin::serve(handler, addr)
                .await
                .context("Webhook server stopped")?;
        }
        Command::Analyze {
            ref document_id,
            json,
            ..
        } => {
            let mut handler = DocumentAnalysisHandler::from_config(config)
                .context("Failed to initialise the analysis handler")?;
            if show_progress {
                handler = handler.with_progress(CliProgressCallback::new() as ProgressCallback);
            }

            let outcome = handler
                .analyze(document_id)
                .await
                .with_context(|| format!("Analysis of document {document_id} failed"))?;

            if json {
                let out =
                    serde_json::to_string_pretty(&outcome).context("Failed to serialise outcome")?;
                println!("{out}");
            } else if !cli.quiet {
                print_summary(&outcome);
            }
        }
    }

    Ok(())
}

/// Read the environment and apply CLI overrides.
fn build_config(cli: &Cli) -> Result<AnalysisConfig> {
    let mut config = AnalysisConfig::from_env().context("Invalid configuration")?;

    if let Some(ref model) = cli.model {
        config.model = Some(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        config.provider_name = Some(provider.clone());
    }
    if let Some(secs) = cli.call_timeout {
        anyhow::ensure!(secs > 0, "--call-timeout must be greater than zero");
        config.call_timeout_secs = secs;
    }
    if let Some(secs) = cli.download_timeout {
        anyhow::ensure!(secs > 0, "--download-timeout must be greater than zero");
        config.download_timeout_secs = secs;
    }
    Ok(config)
}

fn print_summary(outcome: &AnalysisOutcome) {
    let f = &outcome.fields;
    println!("Document:            {}", outcome.document_id);
    println!(
        "Period:              {:02}/{}",
        f.reference_month, f.reference_year
    );
    println!("Total revenue:       {:.2}", f.total_revenue);
    println!("Total expenses:      {:.2}", f.total_expenses);
    println!("Reserve fund:        {:.2}", f.reserve_fund);
    println!("Default amount:      {:.2}", f.default_amount);
    println!("Cost per unit:       {:.2}", f.cost_per_unit);
    println!("Personnel expenses:  {:.1}%", f.personnel_expense_percentage);
    eprintln!(
        "   {}",
        dim(&format!(
            "{} bytes  ·  {} chars  ·  {}ms total",
            outcome.stats.file_bytes, outcome.stats.text_chars, outcome.stats.total_ms
        ))
    );
}
