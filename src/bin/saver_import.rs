use std::env;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use saver::api::ImportOptions;
use saver::config::Config;
use saver::credentials::sign_in;
use saver::import::Provider;
use saver::AppContext;

struct Args {
    start: Option<Provider>,
    provider_token: Option<String>,
    token: Option<String>,
    email: Option<String>,
}

#[tokio::main]
async fn main() {
    // Use RUST_LOG env var if set, otherwise default to info level
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let argv: Vec<String> = env::args().collect();
    let args = parse_args(&argv);

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Using backend at {}", config.api_base_url);

    let context = AppContext::from_config(config);

    if let Some(token) = &args.token {
        let email = args.email.as_deref().unwrap_or_default();
        if let Err(e) = sign_in(context.credentials.as_ref(), token, email) {
            error!("Could not store credentials: {}", e);
            std::process::exit(1);
        }
    }

    let service = context.import_service.clone();

    match service.recover().await {
        Ok(outcome) if !outcome.authenticated => {
            warn!("Not signed in, pass --token to sign in");
        }
        Ok(outcome) => info!(
            "Backend reports {} active session(s), {} recovered",
            outcome.discovered,
            outcome.created.len()
        ),
        Err(e) => warn!("Session discovery failed: {}", e),
    }

    if let Some(provider) = args.start {
        let options = ImportOptions {
            provider_token: args.provider_token.clone(),
            since: None,
        };
        if let Err(e) = service.start_import(provider, &options).await {
            error!("Could not start {} import: {}", provider, e);
            std::process::exit(1);
        }
    }

    let _subscription = context.progress_store.subscribe(|snapshot| {
        if snapshot.is_active {
            info!(
                "[{}] {}% ({}/{}) {}",
                snapshot.session_id,
                snapshot.percentage,
                snapshot.current,
                snapshot.total,
                snapshot.current_action
            );
        }
    });

    let cancel = CancellationToken::new();
    let housekeeping = service.spawn_housekeeping(cancel.clone());
    let mut changes = context.registry.subscribe();

    loop {
        if context.registry.running_jobs().is_empty() {
            info!("No running imports left");
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    for job in context.registry.jobs() {
        match (&job.error, &job.results) {
            (Some(reason), _) => warn!("{} import failed: {}", job.provider, reason),
            (None, Some(results)) => info!("{} import: {}", job.provider, results.summary()),
            _ => info!("{} import {}", job.provider, job.status),
        }
    }

    service.shutdown();
    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(1), housekeeping)
        .await
        .is_err()
    {
        warn!("Housekeeping did not stop in time");
    }
}

fn parse_args(argv: &[String]) -> Args {
    let mut args = Args {
        start: None,
        provider_token: None,
        token: None,
        email: None,
    };

    let mut i = 1;
    while i < argv.len() {
        let flag = argv[i].as_str();
        if flag == "--help" || flag == "-h" {
            print_usage(&argv[0]);
            std::process::exit(0);
        }

        let Some(value) = argv.get(i + 1) else {
            error!("{} requires a value", flag);
            print_usage(&argv[0]);
            std::process::exit(1);
        };

        match flag {
            "--start" => match value.parse::<Provider>() {
                Ok(provider) => args.start = Some(provider),
                Err(e) => {
                    error!("{}", e);
                    std::process::exit(1);
                }
            },
            "--provider-token" => args.provider_token = Some(value.clone()),
            "--token" => args.token = Some(value.clone()),
            "--email" => args.email = Some(value.clone()),
            _ => {
                error!("Unknown argument: {}", flag);
                print_usage(&argv[0]);
                std::process::exit(1);
            }
        }
        i += 2;
    }

    args
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} [OPTIONS]", program);
    eprintln!();
    eprintln!("Recovers imports still running on the backend and follows them until they settle.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --start <provider>        Start a new import (pocket, instapaper, readwise)");
    eprintln!("  --provider-token <token>  Access token for the provider account");
    eprintln!("  --token <token>           Sign in with this auth token first");
    eprintln!("  --email <email>           Email stored alongside --token");
}
