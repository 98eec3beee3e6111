//! # Tenant RAG CLI (`trag`)
//!
//! The `trag` binary drives the engine from the command line: ingest tenant
//! document sets, ask questions, run query batches, and manage the response
//! cache.
//!
//! ## Usage
//!
//! ```bash
//! trag --config ./config/trag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trag tenants` | List tenants with their index generation and size |
//! | `trag ingest <tenant\|all>` | Bring tenant indexes in line with storage |
//! | `trag ingest-url <tenant> <url>` | Fetch a web page into a tenant and ingest it |
//! | `trag query "<question>"` | Answer one question |
//! | `trag batch <file>` | Answer a JSON-lines file of queries in parallel |
//! | `trag invalidate <tenant>` | Drop a tenant's cached answers |
//! | `trag remove-tenant <tenant>` | Delete a tenant's documents, index and cache |
//!
//! ## Examples
//!
//! ```bash
//! # Index everything under storage.documents_dir
//! trag ingest all
//!
//! # Re-ingest after editing one file
//! trag ingest RC --changed policies/remote-work.txt
//!
//! # Ask, letting the router pick the tenant
//! trag query "How many days of remote work does policy 204-B allow?"
//!
//! # Ask one tenant and print the full JSON response
//! trag query "What is the refund window?" --tenant RC --json
//! ```
//!
//! Logs go to stderr; command output goes to stdout.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};

use tenant_rag::config;
use tenant_rag::engine::{QueryRequest, QueryResponse, RagEngine, ResponseStatus};
use tenant_rag::ingest::IngestReport;
use tenant_rag::logging::init_logging;
use tenant_rag::workers::WorkerPool;

/// Tenant RAG CLI: multi-tenant retrieval-augmented question answering.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/trag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "trag",
    about = "Tenant RAG: route questions to the right document set and answer from evidence",
    version,
    long_about = "Tenant RAG keeps an isolated vector index per tenant, routes each question \
    to the tenant (or tenants) most likely to hold the answer, and answers only from retrieved \
    passages, citing its sources."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/trag.toml`. Storage, model, routing, cache,
    /// and logging settings are read from this file.
    #[arg(long, global = true, default_value = "./config/trag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// List tenants and their index state.
    Tenants,

    /// Ingest a tenant's documents, or every tenant with `all`.
    ///
    /// Unchanged documents keep their vectors. Adding or removing a
    /// document rebuilds the tenant; content edits replace only the
    /// affected chunks. Cached answers for the tenant are dropped when a
    /// new index generation is published.
    Ingest {
        /// Tenant id, or `all`.
        tenant: String,

        /// Paths (relative to the tenant directory) known to have changed.
        /// They are re-hashed even if size and mtime look unchanged.
        #[arg(long, num_args = 1..)]
        changed: Vec<String>,
    },

    /// Fetch a web page into a tenant and ingest it.
    ///
    /// The host must match `ingest.allowed_domains`.
    IngestUrl { tenant: String, url: String },

    /// Answer one question.
    Query {
        /// The question (2 to 500 characters).
        text: String,

        /// Restrict the question to this tenant.
        #[arg(long)]
        tenant: Option<String>,

        /// Search all likely tenants instead of asking when routing is unsure.
        #[arg(long)]
        auto: bool,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Answer a file of queries in parallel.
    ///
    /// Each line is either a JSON object
    /// (`{"text": "...", "tenant_hint": "RC", "auto_select": true}`) or a
    /// bare question. One JSON result per line is written to stdout in
    /// input order.
    Batch {
        file: PathBuf,

        /// Apply auto-select to bare-text lines.
        #[arg(long)]
        auto: bool,
    },

    /// Drop every cached answer that depends on a tenant.
    Invalidate { tenant: String },

    /// Delete a tenant's documents, index snapshot and cached answers.
    RemoveTenant { tenant: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg.logging);

    match cli.command {
        Commands::Tenants => {
            let engine = RagEngine::open(cfg)?;
            list_tenants(&engine);
        }
        Commands::Ingest { tenant, changed } => {
            let engine = RagEngine::open(cfg)?;
            run_ingest(&engine, &tenant, &changed)?;
        }
        Commands::IngestUrl { tenant, url } => {
            let engine = RagEngine::open(cfg)?;
            let report = engine.ingest_url(&tenant, &url)?;
            print_report(&report);
        }
        Commands::Query {
            text,
            tenant,
            auto,
            json,
        } => {
            let engine = RagEngine::open(cfg)?;
            let request = QueryRequest {
                text,
                tenant_hint: tenant,
                auto_select: auto,
            };
            let response = engine.query(&request)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_response(&response);
            }
        }
        Commands::Batch { file, auto } => {
            let requests = read_batch(&file, auto)?;
            let pool = WorkerPool::new(&cfg.workers)?;
            let engine = RagEngine::open(cfg)?;
            for result in pool.run_queries(&engine, &requests) {
                let line = match result {
                    Ok(response) => serde_json::to_string(&response)?,
                    Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
                };
                println!("{}", line);
            }
        }
        Commands::Invalidate { tenant } => {
            let engine = RagEngine::open(cfg)?;
            let dropped = engine.invalidate_cache(&tenant);
            println!("Dropped {} cached answer(s) for {}.", dropped, tenant);
        }
        Commands::RemoveTenant { tenant } => {
            let engine = RagEngine::open(cfg)?;
            engine.remove_tenant(&tenant)?;
            println!("Removed tenant {}.", tenant);
        }
    }

    Ok(())
}

fn run_ingest(engine: &RagEngine, tenant: &str, changed: &[String]) -> Result<()> {
    if tenant != "all" {
        let report = engine.ingest(tenant, changed)?;
        print_report(&report);
        return Ok(());
    }
    if !changed.is_empty() {
        bail!("--changed needs a single tenant, not `all`");
    }

    let mut failures = 0;
    for (tenant, result) in engine.ingest_all()? {
        match result {
            Ok(report) => print_report(&report),
            Err(e) => {
                failures += 1;
                eprintln!("{}: ingest failed: {}", tenant, e);
            }
        }
    }
    if failures > 0 {
        bail!("{} tenant(s) failed to ingest", failures);
    }
    Ok(())
}

fn list_tenants(engine: &RagEngine) {
    let tenants = engine.tenants();
    if tenants.is_empty() {
        println!("No tenants.");
        return;
    }
    println!(
        "{:<16} {:>6} {:>9} {:>8}  {:<28} BUILT",
        "TENANT", "GEN", "DOCUMENTS", "CHUNKS", "MODEL"
    );
    for t in tenants {
        println!(
            "{:<16} {:>6} {:>9} {:>8}  {:<28} {}",
            t.tenant, t.generation, t.documents, t.chunks, t.model, t.built_at
        );
    }
}

fn print_report(report: &IngestReport) {
    if report.coalesced {
        println!(
            "{}: rebuild already running, changes will be picked up",
            report.tenant
        );
        return;
    }
    if !report.rebuilt {
        println!("{}: up to date (generation {})", report.tenant, report.generation);
        return;
    }
    println!(
        "{}: generation {} ({}), +{} ~{} -{} documents, {} chunks",
        report.tenant,
        report.generation,
        if report.full_rebuild { "full" } else { "incremental" },
        report.added,
        report.changed,
        report.removed,
        report.chunks
    );
    for path in &report.failed {
        println!("  failed: {}", path);
    }
}

fn print_response(response: &QueryResponse) {
    match response.status {
        ResponseStatus::Disambiguation => {
            println!("{}", response.summary);
            for c in &response.candidate_tenants {
                println!("  {:<16} {:.2}", c.tenant, c.score);
            }
            return;
        }
        ResponseStatus::SmallTalk | ResponseStatus::NotConfigured => {
            println!("{}", response.summary);
            return;
        }
        _ => {}
    }

    if let Some(tenant) = &response.selected_tenant {
        println!("[{} | confidence {:.2}]", tenant, response.route_confidence);
    }
    println!("{}", response.summary);
    if !response.detailed_response.is_empty() && response.detailed_response != response.summary {
        println!();
        println!("{}", response.detailed_response);
    }
    if !response.key_points.is_empty() {
        println!();
        for point in &response.key_points {
            println!("  - {}", point);
        }
    }
    if !response.codes.is_empty() {
        println!();
        println!("Codes: {}", response.codes.join(", "));
    }
    if !response.sources.is_empty() {
        println!();
        println!("Sources:");
        for s in &response.sources {
            if s.pages.is_empty() {
                println!("  {} ({}, {:.2})", s.source, s.tenant, s.relevance);
            } else {
                let pages: Vec<String> = s.pages.iter().map(u32::to_string).collect();
                println!(
                    "  {} p. {} ({}, {:.2})",
                    s.source,
                    pages.join(", "),
                    s.tenant,
                    s.relevance
                );
            }
        }
    }
}

/// Parse a batch file: JSON request objects or bare questions, one per line.
fn read_batch(path: &Path, auto: bool) -> Result<Vec<QueryRequest>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open batch file: {}", path.display()))?;
    let mut requests = Vec::new();
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request = if line.starts_with('{') {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid query object", path.display(), n + 1))?
        } else {
            QueryRequest {
                auto_select: auto,
                ..QueryRequest::new(line)
            }
        };
        requests.push(request);
    }
    Ok(requests)
}
