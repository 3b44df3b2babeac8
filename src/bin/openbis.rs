use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use openbis_toolkit::app::{App, DownloadOptions, InfoRequest, ProgressSink, UploadResult};
use openbis_toolkit::config::{ConfigKey, ConfigScope, ConfigStore, ResolvedConfig};
use openbis_toolkit::credentials::Credentials;
use openbis_toolkit::domain::{CollectionPath, DatasetCode, RelationKind, SearchTarget};
use openbis_toolkit::error::ObisError;
use openbis_toolkit::openbis::OpenbisHttpClient;
use openbis_toolkit::output::{JsonOutput, OutputMode, TextOutput, TextProgress};
use openbis_toolkit::upload::{self, FileKind, UploadRequest};

#[derive(Parser)]
#[command(name = "openbis")]
#[command(about = "Search, download and upload OpenBIS datasets")]
#[command(version, author)]
struct Cli {
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Test the connection and count visible spaces")]
    Connect {
        #[arg(short, long)]
        verbose: bool,
    },
    #[command(about = "Read or change configuration")]
    Config(ConfigArgs),
    #[command(about = "Search experiments, samples and datasets by code")]
    Search(SearchArgs),
    #[command(about = "Download a dataset, skipping files already present")]
    Download(DownloadArgs),
    #[command(about = "Download every dataset of a collection")]
    DownloadCollection(CollectionArgs),
    #[command(about = "Show spaces, dataset or sample details")]
    Info(InfoArgs),
    #[command(about = "Show parent/child datasets")]
    Relations(RelationsArgs),
    #[command(about = "Upload a file, detecting its type")]
    Upload(UploadCommandArgs),
    #[command(about = "Upload a spectral library with DIA-NN metadata")]
    UploadLib(UploadArgs),
    #[command(about = "Upload a FASTA database")]
    UploadFasta(UploadArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        /// Write to ~/.openbis/config.json instead of ./.openbis/config.json.
        #[arg(long)]
        global: bool,
    },
    Unset {
        key: String,
        #[arg(long)]
        global: bool,
    },
    List,
}

#[derive(Args)]
struct SearchArgs {
    query: String,

    #[arg(long = "type", value_enum, default_value = "all")]
    target: SearchTarget,

    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Args)]
struct TransferArgs {
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    list_only: bool,

    /// Re-download files that look up to date.
    #[arg(long)]
    force: bool,

    /// Compare SHA-1 checksums where the server provides them.
    #[arg(long)]
    verify_checksum: bool,
}

#[derive(Args)]
struct DownloadArgs {
    code: String,

    #[command(flatten)]
    transfer: TransferArgs,
}

#[derive(Args)]
struct CollectionArgs {
    collection: String,

    #[arg(long)]
    limit: Option<usize>,

    #[command(flatten)]
    transfer: TransferArgs,
}

#[derive(Args)]
struct InfoArgs {
    #[arg(long)]
    spaces: bool,

    #[arg(long)]
    dataset: Option<String>,

    #[arg(long)]
    sample: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum RelationArg {
    Children,
    Parents,
    Both,
}

impl RelationArg {
    fn kinds(self) -> Vec<RelationKind> {
        match self {
            RelationArg::Children => vec![RelationKind::Children],
            RelationArg::Parents => vec![RelationKind::Parents],
            RelationArg::Both => vec![RelationKind::Parents, RelationKind::Children],
        }
    }
}

#[derive(Args)]
struct RelationsArgs {
    code: String,

    #[arg(long, value_enum, default_value = "both")]
    kind: RelationArg,

    #[arg(long, default_value_t = 1)]
    depth: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum UploadType {
    Auto,
    Fasta,
    SpectralLibrary,
}

impl UploadType {
    fn kind(self) -> Option<FileKind> {
        match self {
            UploadType::Auto => None,
            UploadType::Fasta => Some(FileKind::Fasta),
            UploadType::SpectralLibrary => Some(FileKind::SpectralLibrary),
        }
    }
}

#[derive(Args)]
struct UploadCommandArgs {
    #[arg(long = "type", value_enum, default_value = "auto")]
    file_type: UploadType,

    #[command(flatten)]
    upload: UploadArgs,
}

#[derive(Args)]
struct UploadArgs {
    file: PathBuf,

    #[arg(long)]
    collection: Option<String>,

    #[arg(long)]
    dataset_type: Option<String>,

    #[arg(long)]
    name: Option<String>,

    /// Release identifier, recorded for FASTA databases.
    #[arg(long)]
    version: Option<String>,

    /// DIA-NN log; parsed for metadata and uploaded alongside the library.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    notes: Option<String>,

    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ObisError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ObisError) -> u8 {
    match error {
        ObisError::DatasetNotFound(_)
        | ObisError::SampleNotFound(_)
        | ObisError::CollectionNotFound(_)
        | ObisError::MissingCredentials(_) => 2,
        ObisError::OpenbisHttp(_)
        | ObisError::OpenbisStatus { .. }
        | ObisError::OpenbisRpc { .. }
        | ObisError::Authentication(_) => 3,
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
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let store = ConfigStore::new()?;

    match cli.command {
        Commands::Config(args) => run_config(args.command, &store, output_mode),
        Commands::Upload(args) if args.upload.dry_run => run_dry_run(
            to_request(args.upload, args.file_type.kind())?,
            &store,
            output_mode,
        ),
        Commands::UploadLib(args) if args.dry_run => run_dry_run(
            to_request(args, Some(FileKind::SpectralLibrary))?,
            &store,
            output_mode,
        ),
        Commands::UploadFasta(args) if args.dry_run => {
            run_dry_run(to_request(args, Some(FileKind::Fasta))?, &store, output_mode)
        }
        command => {
            let resolved = store.resolve()?;
            let app = build_app(&store, &resolved)?;
            run_remote(command, app, &resolved, output_mode)
        }
    }
}

fn build_app(store: &ConfigStore, resolved: &ResolvedConfig) -> miette::Result<App<OpenbisHttpClient>> {
    let credentials = Credentials::load(
        store.credentials_path().as_std_path(),
        resolved.openbis_url.as_deref(),
    )?;
    let client = OpenbisHttpClient::new(
        credentials,
        resolved.verify_certificates,
        Some(store.token_path().into_std_path_buf()),
    )?;
    Ok(App::new(client, resolved.cache_expiry))
}

fn sink_for(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &TextProgress,
    }
}

fn emit<T: Serialize>(output_mode: OutputMode, value: &T, text: fn(&T)) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print(value).into_diagnostic(),
        OutputMode::Text => {
            text(value);
            Ok(())
        }
    }
}

fn run_config(command: ConfigCommand, store: &ConfigStore, output_mode: OutputMode) -> miette::Result<()> {
    let scope = |global: bool| {
        if global {
            ConfigScope::Global
        } else {
            ConfigScope::Local
        }
    };
    match command {
        ConfigCommand::Get { key } => {
            let entry = store.get(key.parse::<ConfigKey>()?)?;
            emit(output_mode, &vec![entry], |entries| TextOutput::config_entries(entries))
        }
        ConfigCommand::List => {
            let entries = store.list()?;
            emit(output_mode, &entries, |entries| TextOutput::config_entries(entries))
        }
        ConfigCommand::Set { key, value, global } => {
            let change = store.set(scope(global), key.parse::<ConfigKey>()?, &value)?;
            emit(output_mode, &change, TextOutput::config_change)
        }
        ConfigCommand::Unset { key, global } => {
            let change = store.unset(scope(global), key.parse::<ConfigKey>()?)?;
            emit(output_mode, &change, TextOutput::config_change)
        }
    }
}

fn to_request(args: UploadArgs, kind: Option<FileKind>) -> miette::Result<UploadRequest> {
    let collection = args
        .collection
        .as_deref()
        .map(str::parse::<CollectionPath>)
        .transpose()?;
    Ok(UploadRequest {
        file: args.file,
        kind,
        collection,
        dataset_type: args.dataset_type,
        name: args.name,
        version: args.version,
        log_file: args.log_file,
        notes: args.notes,
        dry_run: args.dry_run,
    })
}

fn run_dry_run(request: UploadRequest, store: &ConfigStore, output_mode: OutputMode) -> miette::Result<()> {
    let resolved = store.resolve()?;
    let plan = upload::prepare(&request, resolved.default_collection.as_ref())?;
    let result = UploadResult {
        dry_run: true,
        dataset_code: None,
        plan,
    };
    emit(output_mode, &result, TextOutput::upload)
}

fn run_remote(
    command: Commands,
    mut app: App<OpenbisHttpClient>,
    resolved: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let sink = sink_for(output_mode);
    let options = |transfer: &TransferArgs| DownloadOptions {
        force: transfer.force,
        verify_checksum: transfer.verify_checksum || resolved.verify_checksum,
    };
    let output_dir = |transfer: &TransferArgs| {
        transfer
            .output
            .clone()
            .unwrap_or_else(|| resolved.output_dir.clone().into_std_path_buf())
    };

    match command {
        Commands::Connect { verbose } => {
            let result = app.connect(verbose, sink)?;
            emit(output_mode, &result, TextOutput::connect)
        }
        Commands::Search(args) => {
            let result = app.search(&args.query, args.target, args.limit, sink)?;
            emit(output_mode, &result, TextOutput::search)
        }
        Commands::Download(args) => {
            let code: DatasetCode = args.code.parse()?;
            if args.transfer.list_only {
                let result = app.list_dataset_files(&code, sink)?;
                return emit(output_mode, &result, TextOutput::files);
            }
            let result = app.download_dataset(
                &code,
                &output_dir(&args.transfer),
                options(&args.transfer),
                sink,
            )?;
            emit(output_mode, &result, TextOutput::download)
        }
        Commands::DownloadCollection(args) => {
            let collection: CollectionPath = args.collection.parse()?;
            if args.transfer.list_only {
                let result = app.list_collection(&collection, args.limit, sink)?;
                return emit(output_mode, &result, TextOutput::collection);
            }
            let result = app.download_collection(
                &collection,
                &output_dir(&args.transfer),
                args.limit,
                options(&args.transfer),
                sink,
            )?;
            emit(output_mode, &result, TextOutput::collection_download)?;
            if !result.is_success() {
                return Err(ObisError::CollectionIncomplete {
                    collection: result.collection,
                    failed: result.failures.len(),
                    total: result.attempted,
                }
                .into());
            }
            Ok(())
        }
        Commands::Info(args) => {
            let request = InfoRequest {
                spaces: args.spaces,
                dataset: args
                    .dataset
                    .as_deref()
                    .map(str::parse::<DatasetCode>)
                    .transpose()?,
                sample: args.sample,
            };
            let result = app.info(&request, sink)?;
            emit(output_mode, &result, TextOutput::info)
        }
        Commands::Relations(args) => {
            let code: DatasetCode = args.code.parse()?;
            let graph = app.relations(&code, &args.kind.kinds(), args.depth, sink)?;
            emit(output_mode, &graph, TextOutput::relations)
        }
        Commands::Upload(args) => upload_with(
            &app,
            to_request(args.upload, args.file_type.kind())?,
            resolved,
            output_mode,
        ),
        Commands::UploadLib(args) => upload_with(
            &app,
            to_request(args, Some(FileKind::SpectralLibrary))?,
            resolved,
            output_mode,
        ),
        Commands::UploadFasta(args) => upload_with(
            &app,
            to_request(args, Some(FileKind::Fasta))?,
            resolved,
            output_mode,
        ),
        Commands::Config(_) => Err(miette::Report::msg("config does not need a connection")),
    }
}

fn upload_with(
    app: &App<OpenbisHttpClient>,
    request: UploadRequest,
    resolved: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = app.upload(
        &request,
        resolved.default_collection.as_ref(),
        sink_for(output_mode),
    )?;
    emit(output_mode, &result, TextOutput::upload)
}
