use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::http::{HeaderMap, HeaderValue};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use vidhook_core::callback::request::normalize_path;
use vidhook_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use vidhook_core::logging::{self, LogFilters, RedactingMakeWriter, DEFAULT_LOG_FILTER};
use vidhook_core::secrets::{secret_store_from_config, SecretProvider};
use vidhook_core::server::{app_router, app_state_with_config};
use vidhook_core::signature::{self, format_http_date, SigningParts};

const SIGNED_HEADER_NAMES: [&str; 2] = ["Date", "X-Nonce"];

#[derive(Parser)]
#[command(
    name = "vidhook",
    about = "Provider callback ingestion server",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the headers a provider would attach to a callback body.
    Sign(SignArgs),
}

#[derive(Args)]
struct SignArgs {
    #[arg(long, help = "Path to the JSON callback body (not part of the signature)")]
    body: Option<PathBuf>,
    #[arg(long, help = "HTTP date to sign (defaults to now)")]
    date: Option<String>,
    #[arg(long, help = "Request path to sign (defaults to the configured webhook path)")]
    path: Option<String>,
    #[arg(long, default_value = "", help = "Raw query string to sign")]
    query: String,
    #[arg(long, help = "Nonce header value (defaults to a random UUID)")]
    nonce: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let command = match cli.command {
        Some(Commands::Sign(_)) => "sign",
        None => "serve",
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    info!(
        command,
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "vidhook starting"
    );

    match cli.command {
        Some(Commands::Sign(args)) => sign_callback(args, resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

/// Console on stderr plus the redacting file sink. Either sink failing to come up leaves the
/// process running with whatever is left.
fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_reporter = logging::install_crash_reporter(data_dir);

    let rust_log = std::env::var("RUST_LOG").ok();
    let filters = LogFilters::select(cli_log_filter, verbose, rust_log.as_deref());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter_or_default(&filters.console, "console"));

    let (file_layer, file_error) = match logging::open_log_appender(data_dir) {
        Ok(appender) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(RedactingMakeWriter::new(appender))
                .with_filter(env_filter_or_default(&filters.file, "file"));
            (Some(layer), None)
        }
        Err(err) => (None, Some(err)),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install tracing subscriber: {err}");
        return;
    }

    if let Some(err) = file_error {
        warn!(error = %format!("{err:#}"), "file logging unavailable; logging to console only");
    }
    if let Err(err) = crash_reporter {
        warn!(error = %format!("{err:#}"), "crash reports disabled");
    }
}

fn env_filter_or_default(filter: &str, sink: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|err| {
        eprintln!("Invalid {sink} log filter '{filter}': {err}. Using '{DEFAULT_LOG_FILTER}'.");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> AppConfig {
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = app_state_with_config(config, data_dir)?;
    let webhook_path = state.webhook_path().to_string();
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, %webhook_path, "Starting vidhook server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn sign_callback(args: SignArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let secrets = SecretProvider::new(
        secret_store_from_config(&config.secrets.source, &data_dir),
        config.provider.name.clone(),
    );
    let secret = secrets.get().await?;

    let headers = signing_headers(
        args.date.unwrap_or_else(|| format_http_date(Utc::now())),
        args.nonce
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
    )?;
    let path = args
        .path
        .map(|path| normalize_path(&path, &[]))
        .unwrap_or_else(|| normalize_path(&config.webhook.path, &[]));

    let parts = SigningParts {
        method: "POST",
        path: &path,
        query: &args.query,
        headers: &headers,
    };
    let signature = signature::sign(
        &secret,
        &config.webhook.signing_tag,
        &parts,
        &SIGNED_HEADER_NAMES,
    )?;

    for name in SIGNED_HEADER_NAMES {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            println!("{name}: {value}");
        }
    }
    println!("X-HMAC-ALGORITHM: {}", signature::EXPECTED_ALGORITHM);
    println!("X-HMAC-SIGNED-HEADERS: {}", SIGNED_HEADER_NAMES.join(";"));
    println!("X-HMAC-SIGNATURE: {signature}");

    if let Some(body) = args.body {
        let raw = std::fs::read(&body)
            .with_context(|| format!("failed to read callback body {}", body.display()))?;
        serde_json::from_slice::<serde_json::Value>(&raw)
            .with_context(|| format!("{} is not valid JSON", body.display()))?;
        info!(body = %body.display(), bytes = raw.len(), "callback body checked");
    }
    Ok(())
}

fn signing_headers(date: String, nonce: String) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "date",
        HeaderValue::from_str(&date).context("date is not a valid header value")?,
    );
    headers.insert(
        "x-nonce",
        HeaderValue::from_str(&nonce).context("nonce is not a valid header value")?,
    );
    Ok(headers)
}

#[cfg(test)]
mod sign_tests {
    use super::*;
    use vidhook_core::signature::SignatureVerifier;

    #[test]
    fn printed_signature_verifies_against_the_server_path() {
        let date = "Tue, 14 Oct 2025 08:30:00 GMT".to_string();
        let headers = signing_headers(date.clone(), "abc123".to_string()).unwrap();
        let path = normalize_path("/webhooks/vidu/", &[]);
        let parts = SigningParts {
            method: "POST",
            path: &path,
            query: "",
            headers: &headers,
        };
        let signature = signature::sign("s3cret", "vidu", &parts, &SIGNED_HEADER_NAMES).unwrap();

        let now = signature::parse_http_date(&date).unwrap();
        let verifier = SignatureVerifier::new("vidu", 300_000);
        let result = verifier.verify_at(
            now,
            "s3cret",
            &parts,
            Some(signature.as_str()),
            Some("Date;X-Nonce"),
        );
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn rejects_header_values_with_newlines() {
        assert!(signing_headers("bad\ndate".to_string(), "n".to_string()).is_err());
    }
}
