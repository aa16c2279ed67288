//! Tessera CLI - parse, check, render and benchmark `.tess` files

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tessera::directives::infer_literal;
use tessera::{
    compile, format_parse_error, format_render_error, parse_str, Document, Fixtures, RenderRequest,
    Runtime, RuntimeConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Tessera - declarative tag-based markup language", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to TESSERA_CONFIG or ./tessera.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a file and print its tree
    Parse {
        path: PathBuf,

        #[arg(short, long, value_enum, default_value = "debug")]
        format: TreeFormat,
    },

    /// Validate files, directories or glob patterns
    Check {
        #[arg(required = true, num_args = 1..)]
        paths: Vec<String>,
    },

    /// Render a file
    Render {
        path: PathBuf,

        /// Component to render instead of the default entry point
        #[arg(long)]
        component: Option<String>,

        /// Render through the compiled backend
        #[arg(long)]
        compiled: bool,

        /// Seed a page variable (`name=value`)
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Session id whose scope the render shares
        #[arg(long)]
        session: Option<String>,

        /// JSON fixtures backing queries, HTTP targets and models
        #[arg(long, value_name = "FILE")]
        fixtures: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value = "text")]
        format: RenderFormat,
    },

    /// Compare interpreted and compiled rendering time
    Bench {
        path: PathBuf,

        #[arg(short = 'n', long, default_value = "1000")]
        iterations: u32,

        #[arg(long, value_name = "FILE")]
        fixtures: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TreeFormat {
    Debug,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RenderFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("TESSERA_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = RuntimeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Parse { path, format } => {
            let (_, doc) = load(&path)?;
            match format {
                TreeFormat::Debug => println!("{:#?}", doc),
                TreeFormat::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
                TreeFormat::Yaml => print!("{}", serde_yaml::to_string(&doc)?),
            }
        }

        Commands::Check { paths } => {
            let files = collect_files(&paths)?;
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.workers.max(1))
                .build()?;
            let failures: Vec<String> = pool.install(|| {
                files
                    .par_iter()
                    .filter_map(|file| check_file(file).err())
                    .collect()
            });

            for failure in &failures {
                eprintln!("{}", failure);
            }
            let passed = files.len() - failures.len();
            if failures.is_empty() {
                println!("{} {} file(s) checked", "✓".green().bold(), passed);
            } else {
                eprintln!(
                    "{} {} error(s), {} file(s) passed",
                    "✗".red().bold(),
                    failures.len(),
                    passed
                );
                std::process::exit(1);
            }
        }

        Commands::Render {
            path,
            component,
            compiled,
            vars,
            session,
            fixtures,
            format,
        } => {
            let (source, doc) = load(&path)?;
            let runtime = build_runtime(config, fixtures.as_deref())?;

            let mut request = RenderRequest::new();
            for var in &vars {
                let (name, value) = parse_var(var)?;
                request = request.variable(name, value);
            }
            if let Some(component) = component {
                request = request.component(component);
            }
            if let Some(session) = session {
                request = request.session(session);
            }

            let rendered = if compiled {
                let unit = compile(&doc).map_err(|e| anyhow::anyhow!(format_parse_error(&e, &source)))?;
                runtime.render_compiled(&unit, request).await
            } else {
                runtime.render(&doc, request).await
            };
            let output = match rendered {
                Ok(output) => output,
                Err(e) => {
                    eprint!("{}", format_render_error(&e, &source));
                    std::process::exit(1);
                }
            };

            match format {
                RenderFormat::Text => println!("{}", output.body),
                RenderFormat::Json => println!("{}", serde_json::to_string_pretty(&output.to_json())?),
            }
        }

        Commands::Bench {
            path,
            iterations,
            fixtures,
        } => {
            let (_, doc) = load(&path)?;
            let unit = compile(&doc)?;
            let runtime = build_runtime(config, fixtures.as_deref())?;
            let iterations = iterations.max(1);

            println!("{} {}", "Benchmarking:".blue().bold(), path.display());
            println!("{} {}", "Iterations:".dimmed(), iterations);

            let start = Instant::now();
            for _ in 0..iterations {
                runtime.render(&doc, RenderRequest::new()).await?;
            }
            let interpreted = start.elapsed() / iterations;

            let start = Instant::now();
            for _ in 0..iterations {
                runtime.render_compiled(&unit, RenderRequest::new()).await?;
            }
            let compiled = start.elapsed() / iterations;

            println!("  {:<12} {}", "interpreted", format_duration(interpreted));
            println!("  {:<12} {}", "compiled", format_duration(compiled));
            if !compiled.is_zero() {
                println!(
                    "  {:<12} {:.2}x",
                    "speedup",
                    interpreted.as_secs_f64() / compiled.as_secs_f64()
                );
            }
        }
    }

    Ok(())
}

/// Read and parse a file, printing the formatted diagnostic on failure
fn load(path: &Path) -> Result<(String, Document)> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    match parse_str(&source) {
        Ok(doc) => Ok((source, doc)),
        Err(e) => {
            eprint!("{}", format_parse_error(&e, &source));
            std::process::exit(1);
        }
    }
}

fn check_file(path: &Path) -> std::result::Result<(), String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("{} {}: {}", "✗".red().bold(), path.display(), e))?;
    parse_str(&source).map(drop).map_err(|e| {
        format!(
            "{} {}\n{}",
            "✗".red().bold(),
            path.display(),
            format_parse_error(&e, &source)
        )
    })
}

/// Expand files, directories (`*.tess` inside) and glob patterns
fn collect_files(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let path = PathBuf::from(pattern);
        if path.is_file() {
            files.push(path);
        } else if path.is_dir() {
            for entry in std::fs::read_dir(&path)? {
                let entry = entry?.path();
                if entry.extension().and_then(|e| e.to_str()) == Some("tess") {
                    files.push(entry);
                }
            }
        } else {
            let matches =
                glob::glob(pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))?;
            for entry in matches {
                files.push(entry?);
            }
        }
    }

    if files.is_empty() {
        bail!("No files matched {}", patterns.join(", "));
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn build_runtime(config: RuntimeConfig, fixtures: Option<&Path>) -> Result<Runtime> {
    let mut builder = Runtime::builder().config(config);
    if let Some(path) = fixtures {
        builder = builder.providers(Fixtures::from_file(path)?.into_providers());
    }
    Ok(builder.build())
}

fn parse_var(var: &str) -> Result<(String, tessera::Value)> {
    let Some((name, value)) = var.split_once('=') else {
        bail!("Invalid --var '{}': expected NAME=VALUE", var);
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("Invalid --var '{}': empty name", var);
    }
    Ok((name.to_string(), infer_literal(value)))
}

fn format_duration(duration: Duration) -> String {
    let micros = duration.as_secs_f64() * 1_000_000.0;
    if micros < 1000.0 {
        format!("{:.2}µs", micros)
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}
