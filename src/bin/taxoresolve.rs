use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use taxoresolve::app::{App, ResolveOptions};
use taxoresolve::config::{ConfigLoader, ResolverConfig};
use taxoresolve::error::TaxoError;
use taxoresolve::output::JsonOutput;
use taxoresolve::verifier::{GnVerifierHttpClient, VerifierClient, VerifierOptions, VerifierRequest};

#[derive(Parser)]
#[command(name = "taxoresolve")]
#[command(about = "Harmonize taxonomic labels against external name-resolution authorities")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Resolve input entries into a consistent 7-rank classification")]
    Resolve(ResolveArgs),
    #[command(about = "Inspect or clear the content-addressed cache")]
    Cache(CacheArgs),
}

#[derive(Args)]
struct ResolveArgs {
    #[arg(long)]
    input: String,

    #[arg(long)]
    output_dir: String,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    parallelism: Option<usize>,

    /// Ordered authority precedence override, comma-separated ids (e.g. "11,172,1").
    #[arg(long)]
    sources: Option<String>,

    /// Clear this run's cache namespace and delete exactly the files listed
    /// in an existing manifest before writing fresh output.
    #[arg(long)]
    full_rerun: bool,

    /// Accept input taxonomies as-is, bypassing resolution.
    #[arg(long)]
    force_input: bool,

    #[arg(long)]
    no_cache: bool,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "Show cache diagnostics for an input's namespace")]
    Stats(CacheStatsArgs),
    #[command(about = "Clear one namespace or the whole cache")]
    Clear(CacheClearArgs),
}

#[derive(Args)]
struct CacheStatsArgs {
    #[arg(long)]
    input: String,

    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct CacheClearArgs {
    #[arg(long)]
    input: Option<String>,

    #[arg(long)]
    all: bool,

    #[arg(long)]
    config: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(taxo) = report.downcast_ref::<TaxoError>() {
            return ExitCode::from(map_exit_code(taxo));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &TaxoError) -> u8 {
    match error {
        TaxoError::NoInputFiles(_)
        | TaxoError::ConfigRead(_)
        | TaxoError::ConfigParse(_)
        | TaxoError::EmptyAuthorityList
        | TaxoError::InvalidAuthority(_) => 2,
        TaxoError::VerifierHttp(_) | TaxoError::VerifierStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Resolve(args) => run_resolve(args),
        Commands::Cache(args) => match args.command {
            CacheCommand::Stats(args) => run_cache_stats(args),
            CacheCommand::Clear(args) => run_cache_clear(args),
        },
    }
}

fn load_config(
    path: Option<&str>,
    batch_size: Option<usize>,
    parallelism: Option<usize>,
    sources: Option<&str>,
) -> miette::Result<ResolverConfig> {
    let mut config = ConfigLoader::resolve(path).into_diagnostic()?;
    if let Some(batch_size) = batch_size {
        config.batch_size = batch_size;
    }
    if let Some(parallelism) = parallelism {
        config.parallelism = parallelism;
    }
    if let Some(sources) = sources {
        config.authorities = ConfigLoader::parse_source_override(sources).into_diagnostic()?;
    }
    Ok(config)
}

fn run_resolve(args: ResolveArgs) -> miette::Result<()> {
    let config = load_config(
        args.config.as_deref(),
        args.batch_size,
        args.parallelism,
        args.sources.as_deref(),
    )?;

    let options = ResolveOptions {
        input: Utf8PathBuf::from(args.input),
        output_dir: Utf8PathBuf::from(args.output_dir),
        full_rerun: args.full_rerun,
        force_input: args.force_input,
        no_cache: args.no_cache,
    };

    let result = if options.force_input {
        // Forced runs never reach the verifier; a network client is not needed.
        let app = App::new(config, NopVerifier);
        app.resolve(&options, &JsonOutput).into_diagnostic()?
    } else {
        let verifier = GnVerifierHttpClient::new().into_diagnostic()?;
        let app = App::new(config, verifier);
        app.resolve(&options, &JsonOutput).into_diagnostic()?
    };

    JsonOutput::print_resolve(&result).into_diagnostic()?;
    Ok(())
}

fn run_cache_stats(args: CacheStatsArgs) -> miette::Result<()> {
    let config = load_config(args.config.as_deref(), None, None, None)?;
    let app = App::new(config, NopVerifier);
    let stats = app
        .cache_stats(&Utf8PathBuf::from(args.input), false)
        .into_diagnostic()?;
    JsonOutput::print_cache_stats(&stats).into_diagnostic()?;
    Ok(())
}

fn run_cache_clear(args: CacheClearArgs) -> miette::Result<()> {
    let config = load_config(args.config.as_deref(), None, None, None)?;
    let app = App::new(config, NopVerifier);
    let input = args.input.map(Utf8PathBuf::from);
    let result = app
        .cache_clear(input.as_deref(), args.all)
        .into_diagnostic()?;
    JsonOutput::print_cache_clear(&result).into_diagnostic()?;
    Ok(())
}

struct NopVerifier;

impl VerifierClient for NopVerifier {
    fn verify_batch(
        &self,
        _requests: &[VerifierRequest],
        _options: &VerifierOptions,
    ) -> Result<Vec<taxoresolve::verifier::VerifiedName>, TaxoError> {
        Err(TaxoError::VerifierHttp(
            "verifier client not configured".to_string(),
        ))
    }
}
