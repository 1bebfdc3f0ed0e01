//! snipbox CLI
//!
//! Runs Rust snippets from the command line, or serves a stream of requests
//! as newline-delimited JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use snipbox::config::Backend;
use snipbox::{Config, EXAMPLE_CONFIG, Executor, prepare_cgroup};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "snipbox")]
#[command(about = "Compile and run untrusted Rust snippets in sandboxes")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one snippet and print its result
    Run {
        /// File containing the snippet (default: stdin)
        #[arg(value_name = "FILE", conflicts_with = "expr")]
        source: Option<PathBuf>,

        /// Snippet given inline
        #[arg(short = 'e', long = "expr", value_name = "CODE")]
        expr: Option<String>,
    },

    /// Serve JSON-lines requests from stdin, writing one reply per request to stdout
    Worker {
        /// Requests executed at the same time
        #[arg(short = 'j', long, default_value = "4")]
        concurrency: usize,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path (default: snipbox.toml)
        #[arg(short, long, default_value = "snipbox.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// List the namespaces snippets may use
    Namespaces,

    /// Show the effective configuration
    ShowConfig,
}

/// One queued request
#[derive(Debug, Deserialize)]
struct Envelope {
    client_id: String,
    code: String,
}

/// The reply pushed back for an [`Envelope`]
#[derive(Debug, Serialize)]
struct Reply {
    client_id: String,
    status: &'static str,
    result: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // stdout carries results, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    if config.sandbox.backend == Backend::Isolate && config.sandbox.cgroup {
        match prepare_cgroup(&config.sandbox.cg_root) {
            Ok(true) => debug!("cgroup hierarchy ready"),
            Ok(false) => {
                warn!("cgroup support unavailable (memory controller not found), running without --cg");
                config.sandbox.cgroup = false;
            }
            Err(e) => {
                warn!("cgroup setup failed: {e}, running without --cg");
                config.sandbox.cgroup = false;
            }
        }
    }

    match cli.command {
        Commands::Run { source, expr } => run_snippet(config, source.as_deref(), expr).await,
        Commands::Worker { concurrency } => run_worker(config, concurrency).await,
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Namespaces => {
            for namespace in &config.namespaces {
                println!("{namespace}");
            }
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

async fn run_snippet(config: Config, source: Option<&Path>, expr: Option<String>) -> Result<()> {
    let snippet = match (expr, source) {
        (Some(code), _) => code,
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read snippet from '{}'", path.display()))?,
        (None, None) => {
            let mut code = String::new();
            tokio::io::stdin()
                .read_to_string(&mut code)
                .await
                .context("failed to read snippet from stdin")?;
            code
        }
    };

    let executor = Executor::new(config);
    let text = executor.execute(&snippet).await;
    println!("{text}");
    Ok(())
}

async fn run_worker(config: Config, concurrency: usize) -> Result<()> {
    let executor = Arc::new(Executor::new(config));
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel::<Reply>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = rx.recv().await {
            let mut line = serde_json::to_vec(&reply).context("failed to encode reply")?;
            line.push(b'\n');
            stdout
                .write_all(&line)
                .await
                .context("failed to write reply")?;
            stdout.flush().await.context("failed to flush stdout")?;
        }
        anyhow::Ok(())
    });

    info!(concurrency, "worker ready");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();

    while let Some(line) = lines.next_line().await.context("failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "skipping malformed request");
                continue;
            }
        };

        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .context("worker semaphore closed")?;
        let executor = Arc::clone(&executor);
        let tx = tx.clone();

        tasks.spawn(async move {
            debug!(client_id = %envelope.client_id, "executing request");
            let result = executor.execute(&envelope.code).await;
            drop(permit);

            let reply = Reply {
                client_id: envelope.client_id,
                status: "ok",
                result,
            };
            if tx.send(reply).await.is_err() {
                warn!("reply writer stopped, dropping result");
            }
        });

        // Reap finished tasks so the set does not grow with the stream
        while tasks.try_join_next().is_some() {}
    }

    while tasks.join_next().await.is_some() {}
    drop(tx);

    writer.await.context("reply writer panicked")??;
    info!("input closed, worker exiting");
    Ok(())
}

fn show_config(config: &Config) {
    println!("Timeout: {}s", config.timeout_secs);
    println!("Namespaces: {}", config.namespaces.join(", "));
    println!();
    println!("Compiler: {}", config.compiler.rustc.display());
    println!("  Edition: {}", config.compiler.edition);
    println!("  Args: {}", config.compiler.args.join(" "));
    println!("  Timeout: {}s", config.compiler.timeout_secs);
    println!();
    println!("Backend: {:?}", config.sandbox.backend);
    if config.sandbox.backend == Backend::Isolate {
        println!("  Isolate binary: {}", config.isolate_binary().display());
        println!("  Cgroup: {}", config.sandbox.cgroup);
        println!(
            "  Box IDs: {}..{}",
            config.sandbox.first_box_id,
            config.sandbox.first_box_id.saturating_add(config.sandbox.box_count)
        );
        println!("  Mounts: {}", config.sandbox.mounts.len());
    }
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
