use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use openbis_seek_bridge::blacklist::read_optional_blacklist;
use openbis_seek_bridge::config::{
    ConfigLoader, OPENBIS_PASSWORD_VAR, ResolvedConfig, SEEK_PASSWORD_VAR, credential_from_env,
};
use openbis_seek_bridge::error::BridgeError;
use openbis_seek_bridge::mapping::TypeMappingRegistry;
use openbis_seek_bridge::openbis::OpenbisHttpClient;
use openbis_seek_bridge::output::JsonOutput;
use openbis_seek_bridge::seek::SeekHttpClient;
use openbis_seek_bridge::sync::{SyncOptions, SyncOrchestrator};
use openbis_seek_bridge::translator::TranslationEngine;

#[derive(Parser)]
#[command(name = "obs-bridge")]
#[command(about = "Transfers openBIS experiments and their samples and datasets to SEEK")]
#[command(version, author)]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Transfer an experiment with its samples and datasets to a SEEK assay")]
    Transfer(TransferArgs),
    #[command(about = "Create SEEK sample types for openBIS sample types")]
    SampleTypes(SampleTypeArgs),
    #[command(about = "List openBIS spaces")]
    Spaces,
}

#[derive(Args)]
struct TransferArgs {
    /// Experiment identifier (/SPACE/PROJECT/CODE) or permanent id
    experiment: String,

    /// File with dataset codes to leave out, one per line
    #[arg(long)]
    blacklist: Option<PathBuf>,

    /// File with sample codes to leave out, one per line
    #[arg(long)]
    sample_blacklist: Option<PathBuf>,

    /// Upload file content instead of only linking back to openBIS
    #[arg(short = 'd', long = "data")]
    data: bool,

    /// Always create a new assay, even if one for this experiment exists
    #[arg(long)]
    no_update: bool,
}

#[derive(Args)]
struct SampleTypeArgs {
    /// File with sample type codes to leave out, one per line
    #[arg(long)]
    blacklist: Option<PathBuf>,

    /// Create sample types even if SEEK already has one with the same title
    #[arg(long)]
    ignore_existing: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<BridgeError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BridgeError) -> u8 {
    match error {
        BridgeError::AmbiguousMatch { .. } => 4,
        error if error.is_transport() => 3,
        error if error.is_validation() => 2,
        BridgeError::NotFound(_) | BridgeError::UnsupportedObject { .. } => 2,
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
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Transfer(args) => run_transfer(args, &config),
        Commands::SampleTypes(args) => run_sample_types(args, &config),
        Commands::Spaces => run_spaces(&config),
    }
}

fn run_transfer(args: TransferArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let options = SyncOptions {
        transfer_data: args.data,
        no_update: args.no_update,
        dataset_blacklist: read_optional_blacklist(args.blacklist.as_deref())?,
        sample_blacklist: read_optional_blacklist(args.sample_blacklist.as_deref())?,
    };
    let orchestrator = connect(config)?;
    let result = orchestrator.sync_experiment(&args.experiment, &options, &JsonOutput)?;
    JsonOutput::print_sync(&result).into_diagnostic()?;
    Ok(())
}

fn run_sample_types(args: SampleTypeArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let blacklist = read_optional_blacklist(args.blacklist.as_deref())?;
    let orchestrator = connect(config)?;
    let result =
        orchestrator.transfer_sample_types(&blacklist, args.ignore_existing, &JsonOutput)?;
    JsonOutput::print_sample_types(&result).into_diagnostic()?;
    Ok(())
}

fn run_spaces(config: &ResolvedConfig) -> miette::Result<()> {
    let orchestrator = connect(config)?;
    let result = orchestrator.spaces()?;
    JsonOutput::print_spaces(&result).into_diagnostic()?;
    Ok(())
}

/// Everything that can fail locally is checked before either service is contacted.
fn connect(
    config: &ResolvedConfig,
) -> Result<SyncOrchestrator<OpenbisHttpClient, SeekHttpClient>, BridgeError> {
    let registry = TypeMappingRegistry::load(&config.mappings_dir)?;
    let openbis_password = credential_from_env(OPENBIS_PASSWORD_VAR)?;
    let seek_password = credential_from_env(SEEK_PASSWORD_VAR)?;

    let source = OpenbisHttpClient::connect(&config.openbis, &openbis_password)?;
    let target = SeekHttpClient::new(&config.seek, &seek_password)?;
    let engine = TranslationEngine::new(registry, config);
    Ok(SyncOrchestrator::new(source, target, engine))
}
