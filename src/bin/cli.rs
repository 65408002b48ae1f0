//! jesse-kb CLI
//!
//! Command-line entry point for index runs, plan previews, and
//! configuration management. Designed for scripted use: exit codes are
//! 0 (clean), 1 (plan validation), 2 (completed with failures),
//! 3 (aborted), 4 (configuration).

use clap::{Parser, Subcommand};
use colored::Colorize;
use jesse_kb::config::{ConfigLoader, HandlerType, IndexingConfig, IndexingMode};
use jesse_kb::indexer::{exit_code_for, print_summary, Indexer, RunOptions};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "jesse-kb")]
#[command(about = "Incremental LLM-powered knowledge base indexer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Commands {
    /// Run an index pass over a source tree
    Index {
        /// Source tree root
        #[arg(value_name = "SOURCE_ROOT")]
        source_root: String,

        /// Handler type owning this tree
        #[arg(long, value_enum, default_value = "project-base")]
        handler: HandlerType,

        /// Override the configured indexing mode
        #[arg(long, value_enum)]
        mode: Option<IndexingMode>,

        /// Override the configured concurrency bound
        #[arg(long)]
        concurrency: Option<usize>,

        /// Override the output root (JESSE_OUT_ROOT also applies)
        #[arg(long)]
        out_root: Option<PathBuf>,

        /// Configuration directory (defaults to ~/.jesse)
        #[arg(long)]
        config_dir: Option<PathBuf>,
    },

    /// Show what a run would execute, without side effects
    Preview {
        /// Source tree root
        #[arg(value_name = "SOURCE_ROOT")]
        source_root: String,

        /// Handler type owning this tree
        #[arg(long, value_enum, default_value = "project-base")]
        handler: HandlerType,

        /// Override the configured indexing mode
        #[arg(long, value_enum)]
        mode: Option<IndexingMode>,

        /// Configuration directory (defaults to ~/.jesse)
        #[arg(long)]
        config_dir: Option<PathBuf>,
    },

    /// Show or initialise handler configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
#[clap(rename_all = "kebab-case")]
enum ConfigAction {
    /// Print the effective configuration for a handler
    Show {
        #[arg(long, value_enum, default_value = "project-base")]
        handler: HandlerType,

        #[arg(long)]
        config_dir: Option<PathBuf>,
    },

    /// Write the default configuration file for a handler
    Init {
        #[arg(long, value_enum, default_value = "project-base")]
        handler: HandlerType,

        #[arg(long)]
        config_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match cli.command {
        Commands::Index {
            source_root,
            handler,
            mode,
            concurrency,
            out_root,
            config_dir,
        } => {
            let options = RunOptions {
                source_root: expand(&source_root),
                handler,
                config_dir,
                mode_override: mode,
                concurrency_override: concurrency,
                out_root_override: out_root,
            };
            run_index(&options).await
        }
        Commands::Preview {
            source_root,
            handler,
            mode,
            config_dir,
        } => {
            let options = RunOptions {
                source_root: expand(&source_root),
                handler,
                config_dir,
                mode_override: mode,
                concurrency_override: None,
                out_root_override: None,
            };
            run_preview(&options)
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { handler, config_dir } => show_config(handler, config_dir),
            ConfigAction::Init { handler, config_dir } => init_config(handler, config_dir),
        },
    };

    std::process::exit(code);
}

async fn run_index(options: &RunOptions) -> i32 {
    let indexer = match Indexer::new(options) {
        Ok(indexer) => indexer,
        Err(e) => {
            error!("{}", e);
            eprintln!("{} {}", "error:".red().bold(), e);
            return e.exit_code();
        }
    };
    let max_failures = indexer.config().error_handling.max_reported_failures;

    match indexer.run().await {
        Ok(results) => {
            print_summary(&results, max_failures);
            exit_code_for(&results)
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("{} {}", "aborted:".red().bold(), e);
            e.exit_code()
        }
    }
}

fn run_preview(options: &RunOptions) -> i32 {
    let indexer = match Indexer::for_preview(options) {
        Ok(indexer) => indexer,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return e.exit_code();
        }
    };

    match indexer.preview() {
        Ok(preview) => {
            println!("{}", "Execution preview".bold());
            println!(
                "  {} tasks in {} waves, {} expected LLM calls, ~{:.0}s estimated",
                preview.order.len(),
                preview.total_waves,
                preview.expected_llm_calls,
                preview.estimated_duration_secs
            );
            for (task_type, count) in &preview.counts_by_type {
                println!("  {:>5}  {}", count, task_type);
            }
            for id in &preview.order {
                println!("    {}", id.dimmed());
            }
            0
        }
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            e.exit_code()
        }
    }
}

fn show_config(handler: HandlerType, config_dir: Option<PathBuf>) -> i32 {
    match ConfigLoader::load(handler, config_dir.as_deref()) {
        Ok(config) => {
            match serde_json::to_string_pretty(&*config) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("{} {}", "error:".red().bold(), e);
                    return 4;
                }
            }
            0
        }
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            e.exit_code()
        }
    }
}

fn init_config(handler: HandlerType, config_dir: Option<PathBuf>) -> i32 {
    // Loading generates the file when missing; invalidate first so a
    // fresh directory is honoured even within one process
    ConfigLoader::invalidate();
    match ConfigLoader::load(handler, config_dir.as_deref()) {
        Ok(config) => {
            let default = IndexingConfig::default_for(handler);
            println!(
                "{} configuration for {} (mode: {:?})",
                "ready:".green().bold(),
                handler,
                config.change_detection.indexing_mode
            );
            if config.llm_config.model != default.llm_config.model {
                println!("  model overridden: {}", config.llm_config.model);
            }
            0
        }
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            e.exit_code()
        }
    }
}

fn expand(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn init_logging(verbose: bool) {
    let filter = if verbose { "jesse_kb=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}
