//! # observe-client
//!
//! Observes one resource over QUIC with mutual TLS and exits after ten fresh
//! notifications or the await deadline, whichever comes first.
//!
//! ```text
//! observe-client <host> <port> <path>
//! ```
//!
//! Credentials are read from `tls-client/` (`ca-crt.pem`, `client1-key.pem`,
//! `client1-crt.pem`). Set `OBSERVE_CONFIG` to a TOML file to override
//! defaults and `RUST_LOG` to change verbosity.
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | threshold reached, or deadline elapsed (logged as a warning) |
//! | 1 | config, credential, handshake or subscription failure |
//! | 2 | bad arguments |

mod args;

use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use observe_core::{
    Completion, Credential, ObserveConfig, ObserveOrchestrator, ObserveReport, ObserveRequest, QuicDialer,
};

use crate::args::{Args, USAGE};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    match run(args).await {
        Ok(report) => {
            match report.completion {
                Completion::ThresholdReached => info!(
                    token = %report.token,
                    delivered = report.delivered,
                    cancel = ?report.cancel,
                    "Observation complete"
                ),
                Completion::TimedOut => warn!(
                    token = %report.token,
                    delivered = report.delivered,
                    cancel = ?report.cancel,
                    "Observation ended before the threshold was reached"
                ),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

async fn run(args: Args) -> Result<ObserveReport> {
    let config = ObserveConfig::from_env().context("failed to load configuration")?;
    let settings = config.observe_settings()?;

    let paths = config.credential_paths();
    let credential = Credential::load(&paths).context("failed to load client credential")?;
    info!(
        ca = %paths.ca_cert.display(),
        cert = %paths.client_cert.display(),
        "Loaded client credential"
    );

    let dialer = QuicDialer::new(credential, config.session_options());
    let orchestrator = ObserveOrchestrator::new(dialer, settings);
    let request = ObserveRequest {
        host: args.host,
        port: args.port,
        path: args.path,
    };

    let report = orchestrator
        .run(&request)
        .await
        .with_context(|| format!("observation of {}:{}{} failed", request.host, request.port, request.path))?;
    Ok(report)
}
