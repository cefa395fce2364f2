use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use screening_core::{CodeClassifier, ConfigOverrides, MatchMode, ScreeningConfig};
use screening_fhir::{parse_lab_result, resource_type, write_ndjson_line, NdjsonReader};
use screening_source::{
    AzureCliToken, FhirServerConfig, FhirServerSource, NdjsonSource, RecordSource, Screener,
    ScreeningOutcome, ScreeningStats, StaticToken, TokenProvider,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER_OUTPUT: &str = "filtered_type_and_screen_observations.ndjson";

#[derive(Parser, Debug)]
#[command(
    name = "screening",
    about = "Check scheduled surgeries for a current Type & Screen on file."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate every scheduled procedure and write one alert record per line.
    Evaluate(EvaluateArgs),
    /// Keep only Type & Screen observations from NDJSON exports.
    Filter(FilterArgs),
}

#[derive(Args, Debug)]
struct ScreeningArgs {
    /// JSON file with configuration overrides.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Hours before surgery during which a result stays valid.
    #[arg(long)]
    validity_hours: Option<u32>,
    /// How results are classified: code, keyword or either.
    #[arg(long)]
    match_mode: Option<MatchMode>,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    /// FHIR server base URL.
    #[arg(long, env = "FHIR_BASE", conflicts_with_all = ["procedures", "observations"])]
    server: Option<String>,
    /// Bearer token; when absent the Azure CLI is asked for one.
    #[arg(long, env = "FHIR_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Path to the Azure CLI executable.
    #[arg(long, env = "AZ_PATH", default_value = "az")]
    az_path: PathBuf,
    /// NDJSON file of ServiceRequest documents.
    #[arg(long, requires = "observations")]
    procedures: Option<PathBuf>,
    /// NDJSON file of Observation documents.
    #[arg(long, requires = "procedures")]
    observations: Option<PathBuf>,
    /// Output file; stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[command(flatten)]
    screening: ScreeningArgs,
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// NDJSON files to scan; defaults to every *.ndjson in the current directory.
    inputs: Vec<PathBuf>,
    #[arg(short, long, default_value = DEFAULT_FILTER_OUTPUT)]
    output: PathBuf,
    #[command(flatten)]
    screening: ScreeningArgs,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("screening=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Evaluate(args) => evaluate(args),
        Command::Filter(args) => filter(args),
    }
}

fn load_config(args: &ScreeningArgs) -> anyhow::Result<ScreeningConfig> {
    let overrides = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("Could not read config file {path:?}"))?;
            serde_json::from_str::<ConfigOverrides>(&data)
                .with_context(|| format!("Invalid config file {path:?}"))?
        }
        None => ConfigOverrides::default(),
    };

    let mut config = ScreeningConfig::from(overrides);
    if let Some(hours) = args.validity_hours {
        config.validity_hours = hours;
    }
    if let Some(mode) = args.match_mode {
        config.match_mode = mode;
    }
    config.validate()?;
    Ok(config)
}

fn open_output(path: Option<&Path>) -> anyhow::Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Could not create {path:?}"))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

fn evaluate(args: EvaluateArgs) -> anyhow::Result<()> {
    let config = load_config(&args.screening)?;
    let output = open_output(args.output.as_deref())?;

    if let Some(base) = &args.server {
        let server = FhirServerConfig::new(base)?;
        let tokens: Box<dyn TokenProvider> = match &args.token {
            Some(token) => Box::new(StaticToken::new(token.clone())),
            None => Box::new(AzureCliToken::new(&args.az_path, server.base_url())),
        };
        let mut source = FhirServerSource::connect(server, tokens.as_ref())
            .context("Could not connect to the FHIR server")?;
        // Keyword mode has to see every observation, so the server cannot pre-filter by code.
        if !config.match_mode.uses_keywords() {
            source = source.with_code_filter(&config.monitored_codes);
        }
        run_screening(source, &config, output)
    } else if let (Some(procedures), Some(observations)) = (&args.procedures, &args.observations)
    {
        run_screening(NdjsonSource::new(procedures, observations), &config, output)
    } else {
        bail!("Pass --server (or FHIR_BASE) or both --procedures and --observations");
    }
}

fn run_screening<S: RecordSource>(
    source: S,
    config: &ScreeningConfig,
    mut output: Box<dyn Write>,
) -> anyhow::Result<()> {
    let screener = Screener::new(source, config);
    let mut stats = ScreeningStats::default();

    for outcome in screener.outcomes() {
        let outcome = outcome.context("Could not list procedures")?;
        stats.record(&outcome);

        match outcome {
            ScreeningOutcome::Verdict(record) => {
                if record.alert {
                    info!(
                        procedure_id = %record.procedure_id,
                        patient_id = %record.patient_id,
                        reason = %record.reason,
                        "alert"
                    );
                }
                write_ndjson_line(&mut output, &record)?;
            }
            ScreeningOutcome::Skipped(reason) => debug!(%reason, "skipped"),
            ScreeningOutcome::SourceFailure { .. } => {}
        }
    }
    output.flush()?;

    info!(
        evaluated = stats.evaluated,
        alerts = stats.alerts,
        skipped = stats.skipped,
        source_failures = stats.source_failures,
        "screening finished"
    );
    if stats.source_failures > 0 {
        warn!(
            "{} procedure(s) could not be checked because lab results were unavailable",
            stats.source_failures
        );
    }
    Ok(())
}

fn filter(args: FilterArgs) -> anyhow::Result<()> {
    let config = load_config(&args.screening)?;
    let classifier = CodeClassifier::new(&config);

    let inputs = if args.inputs.is_empty() {
        ndjson_files_in(Path::new("."))?
    } else {
        args.inputs
    };
    let output_name = args.output.file_name().map(|name| name.to_os_string());
    let inputs: Vec<PathBuf> = inputs
        .into_iter()
        .filter(|path| path.file_name().map(|name| name.to_os_string()) != output_name)
        .collect();
    if inputs.is_empty() {
        bail!("No NDJSON files to scan; pass file names such as observations-*.ndjson");
    }

    if args.output.exists() {
        warn!(path = %args.output.display(), "overwriting existing output file");
    }
    let mut output = open_output(Some(&args.output))?;

    let mut checked = 0usize;
    let mut kept = 0usize;
    for input in &inputs {
        info!(path = %input.display(), "scanning");
        let file = File::open(input).with_context(|| format!("Could not open {input:?}"))?;
        let mut reader = NdjsonReader::new(BufReader::new(file));

        for line in reader.by_ref() {
            let line = line.with_context(|| format!("Could not read {input:?}"))?;
            checked += 1;
            if resource_type(&line.value) != Some("Observation") {
                continue;
            }
            let Ok(result) = parse_lab_result(&line.value) else {
                continue;
            };
            if classifier.is_qualifying(&result) {
                write_ndjson_line(&mut output, &line.value)?;
                kept += 1;
            }
        }

        if reader.skipped() > 0 {
            warn!(path = %input.display(), skipped = reader.skipped(), "malformed lines skipped");
        }
    }
    output.flush()?;

    info!(
        checked,
        kept,
        output = %args.output.display(),
        "filter finished"
    );
    Ok(())
}

fn ndjson_files_in(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Could not list {dir:?}"))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "ndjson") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
