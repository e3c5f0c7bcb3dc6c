//! Gatekeep - JWT authentication and authorization filter pipeline
//!
//! Command-line front end for validating configuration, minting test tokens
//! and dry-running requests through the pipeline.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use gatekeep::auth::jwt::{SigningKey, TokenIssuer, TokenRequest};
use gatekeep::config::LogFormat;
use gatekeep::pipeline::WhoAmIHandler;
use gatekeep::request::InboundRequest;
use gatekeep::{logging, Config, FilterPipeline};
use hyper::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Gatekeep - JWT authentication and authorization filter pipeline
#[derive(Parser, Debug)]
#[command(name = "gatekeep")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Log output format; overrides the config file
    #[arg(long, global = true, value_enum)]
    log_format: Option<FormatArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg {
    Json,
    Pretty,
}

impl From<FormatArg> for LogFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Json => LogFormat::Json,
            FormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configuration file
    CheckConfig,

    /// Sign a token with the configured key
    IssueToken {
        /// Token subject (`sub` claim)
        #[arg(long)]
        subject: String,

        /// Display name (`name` claim)
        #[arg(long)]
        name: Option<String>,

        /// Granted authority; repeat for several
        #[arg(long = "authority")]
        authorities: Vec<String>,

        /// Lifetime in seconds; defaults to security.token_ttl_seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Run a simulated request through the pipeline and print the response
    Evaluate {
        #[arg(long, default_value = "GET")]
        method: String,

        #[arg(long)]
        path: String,

        /// Query string without the leading '?'
        #[arg(long)]
        query: Option<String>,

        /// Bearer token for the Authorization header
        #[arg(long)]
        token: Option<String>,

        /// Extra header as 'Name: value'; repeat for several
        #[arg(long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(long)]
        body: Option<String>,

        /// Also print Prometheus metrics after the response
        #[arg(long)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    // Initialize logging
    let level = logging::parse_level(args.log_level.as_deref().unwrap_or(&config.logging.level));
    let format = args
        .log_format
        .map(LogFormat::from)
        .unwrap_or(config.logging.format);
    logging::init(level, format)?;

    info!("Gatekeep v{}", gatekeep::VERSION);
    info!("Loaded configuration from {:?}", args.config);
    set_metrics_enabled(&config);

    match args.command {
        Command::CheckConfig => {
            FilterPipeline::from_config(&config, Arc::new(WhoAmIHandler))?;
            println!("Configuration OK");
        }
        Command::IssueToken {
            subject,
            name,
            authorities,
            ttl,
        } => {
            let key = SigningKey::from_config(&config.security.signing_key)?;
            if !key.can_sign() {
                bail!(
                    "{} key has no private component; set signing_key.private_key_pem",
                    config.security.signing_key.algorithm
                );
            }

            let mut issuer = TokenIssuer::from_config(&config.security, Arc::new(key));
            if let Some(ttl) = ttl {
                issuer = issuer.with_ttl(ttl);
            }
            let token = issuer.issue(&TokenRequest {
                subject,
                display_name: name,
                authorities,
            })?;
            println!("{}", token);
        }
        Command::Evaluate {
            method,
            path,
            query,
            token,
            headers,
            body,
            metrics,
        } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid method '{}'", method))?;

            let mut request = InboundRequest::new(method, path);
            if let Some(query) = query {
                request = request.with_query(query);
            }
            if let Some(ref token) = token {
                request = request.with_bearer(token);
            }
            for header in &headers {
                let Some((name, value)) = header.split_once(':') else {
                    bail!("Invalid header '{}', expected 'Name: value'", header);
                };
                request = request.with_header(name.trim(), value.trim());
            }
            if let Some(body) = body {
                request = request.with_body(body);
            }

            let pipeline = FilterPipeline::from_config(&config, Arc::new(WhoAmIHandler))?;
            let response = pipeline.handle(request).await;

            println!("{}", response.status());
            for (name, value) in response.headers() {
                println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
            println!();
            println!("{}", response.body());

            if metrics {
                print_metrics(&config);
            }
        }
    }

    Ok(())
}

#[cfg(feature = "metrics")]
fn print_metrics(config: &Config) {
    if config.metrics.enabled {
        println!();
        print!("{}", gatekeep::metrics::render());
    }
}

#[cfg(not(feature = "metrics"))]
fn print_metrics(_config: &Config) {}

#[cfg(feature = "metrics")]
fn set_metrics_enabled(config: &Config) {
    gatekeep::metrics::set_enabled(config.metrics.enabled);
}

#[cfg(not(feature = "metrics"))]
fn set_metrics_enabled(_config: &Config) {}
