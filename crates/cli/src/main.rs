use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use converge_core::predicates::{all_of, certificate_issued, condition, data_entries_exactly, field_non_empty};
use converge_core::{Predicate, ResourceRef};
use converge_kubehub::KubeAccessor;
use converge_waiter::{CancellationToken, NotFoundPolicy, ObjectAccessor, WaitConfig, WaitOutcome, Waiter};
use serde_json::Value;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "convergectl", version, about = "Wait for Kubernetes objects to converge")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll an object until every given check holds
    Wait {
        /// GVK key, e.g. "v1/Secret" or "cert-manager.io/v1/Certificate"
        gvk: String,
        name: String,
        /// Condition to await as Type=Status (repeatable; default Ready=True)
        #[arg(long = "condition")]
        conditions: Vec<String>,
        /// Condition reason that means the wait can never succeed (repeatable)
        #[arg(long = "terminal-reason")]
        terminal_reasons: Vec<String>,
        /// Dotted path that must hold a non-empty string, e.g. status.acme.uri (repeatable)
        #[arg(long = "field")]
        fields: Vec<String>,
        /// Require exactly N entries under .data
        #[arg(long = "data-entries")]
        data_entries: Option<usize>,
        /// Certificate is Ready=True and has status.notAfter
        #[arg(long = "issued", action = ArgAction::SetTrue)]
        issued: bool,
        /// Overall budget in seconds (env: CONVERGE_TIMEOUT_SECS)
        #[arg(long = "timeout")]
        timeout_secs: Option<u64>,
        /// Poll interval in milliseconds (env: CONVERGE_POLL_INTERVAL_MS)
        #[arg(long = "interval")]
        interval_ms: Option<u64>,
        /// Fail immediately if the object does not exist yet
        #[arg(long = "no-wait-missing", action = ArgAction::SetTrue)]
        no_wait_missing: bool,
        /// Consecutive fetch errors tolerated before giving up (env: CONVERGE_MAX_CONSECUTIVE_ERRORS)
        #[arg(long = "max-errors")]
        max_errors: Option<u32>,
    },
    /// Fetch an object once and print it
    Get {
        /// GVK key, e.g. "v1/Secret" or "cert-manager.io/v1/Issuer"
        gvk: String,
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("CONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_condition(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((t, st)) if !t.trim().is_empty() && !st.trim().is_empty() => Ok((t.trim().to_string(), st.trim().to_string())),
        _ => Err(anyhow!("invalid condition: {} (expect Type=Status, e.g. Ready=True)", s)),
    }
}

struct Checks<'a> {
    conditions: &'a [String],
    terminal_reasons: &'a [String],
    fields: &'a [String],
    data_entries: Option<usize>,
    issued: bool,
}

fn build_predicate(checks: Checks<'_>) -> Result<Box<dyn Predicate<Value>>> {
    let mut parts: Vec<Box<dyn Predicate<Value>>> = Vec::new();
    for raw in checks.conditions {
        let (t, st) = parse_condition(raw)?;
        let mut p = condition(t, st);
        for r in checks.terminal_reasons {
            p = p.terminal_on(r.clone());
        }
        parts.push(Box::new(p));
    }
    for path in checks.fields {
        parts.push(Box::new(field_non_empty(path.clone())));
    }
    if let Some(n) = checks.data_entries {
        parts.push(Box::new(data_entries_exactly(n)));
    }
    if checks.issued {
        parts.push(Box::new(certificate_issued()));
    }
    if parts.is_empty() {
        let mut p = condition("Ready", "True");
        for r in checks.terminal_reasons {
            p = p.terminal_on(r.clone());
        }
        parts.push(Box::new(p));
    }
    if parts.len() == 1 {
        return Ok(parts.remove(0));
    }
    Ok(Box::new(all_of(parts)))
}

#[derive(serde::Serialize)]
struct Summary<'a> {
    gvk: &'a str,
    resource: String,
    condition: &'a str,
    outcome: &'static str,
    polls: u32,
    elapsed_ms: u64,
    observed: Option<&'a str>,
    error: Option<String>,
}

fn exit_code<O>(outcome: &WaitOutcome<O>) -> i32 {
    match outcome {
        WaitOutcome::Satisfied { .. } => 0,
        WaitOutcome::Cancelled { .. } => 130,
        WaitOutcome::TimedOut { .. } | WaitOutcome::Failed { .. } => 1,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Wait {
            gvk,
            name,
            conditions,
            terminal_reasons,
            fields,
            data_entries,
            issued,
            timeout_secs,
            interval_ms,
            no_wait_missing,
            max_errors,
        } => {
            let predicate = build_predicate(Checks {
                conditions: &conditions,
                terminal_reasons: &terminal_reasons,
                fields: &fields,
                data_entries,
                issued,
            })?;

            let mut cfg = WaitConfig::from_env();
            if let Some(secs) = timeout_secs {
                cfg = cfg.with_timeout(Duration::from_secs(secs));
            }
            if let Some(ms) = interval_ms {
                cfg = cfg.with_poll_interval(Duration::from_millis(ms));
            }
            if no_wait_missing {
                cfg = cfg.with_not_found(NotFoundPolicy::Fail);
            }
            if max_errors.is_some() {
                cfg = cfg.with_max_consecutive_errors(max_errors);
            }

            let client = converge_kubehub::client().await?;
            let accessor = KubeAccessor::for_gvk(client, &gvk).await?;
            if ns.is_some() && !accessor.is_namespaced() {
                warn!(gvk = %accessor.gvk_key(), "--ns ignored for cluster-scoped kind");
            }
            let target = ResourceRef::new(ns, &name);
            info!(gvk = %accessor.gvk_key(), resource = %target, "wait invoked");

            let cancel = CancellationToken::new();
            let ctrl_c = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        warn!("Ctrl-C received; cancelling wait");
                        cancel.cancel();
                    }
                }
            });

            let outcome = Waiter::new(cfg).wait_with_cancel(&accessor, &target, predicate.as_ref(), &cancel).await;
            ctrl_c.abort();

            let report = outcome.report();
            let error = outcome.error().map(|e| e.to_string());
            match cli.output {
                Output::Human => match &error {
                    None => println!(
                        "{} {}: {} after {:?} ({} polls)",
                        gvk, report.resource, report.condition, report.elapsed, report.polls
                    ),
                    Some(e) => eprintln!("wait error: {}", e),
                },
                Output::Json => {
                    let summary = Summary {
                        gvk: &gvk,
                        resource: report.resource.to_string(),
                        condition: &report.condition,
                        outcome: outcome.kind(),
                        polls: report.polls,
                        elapsed_ms: report.elapsed.as_millis() as u64,
                        observed: report.observed.as_deref(),
                        error,
                    };
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
            }
            std::process::exit(exit_code(&outcome));
        }
        Commands::Get { gvk, name } => {
            let client = converge_kubehub::client().await?;
            let accessor = KubeAccessor::for_gvk(client, &gvk).await?;
            let target = ResourceRef::new(ns, &name);
            info!(gvk = %accessor.gvk_key(), resource = %target, "get invoked");
            match accessor.fetch(&target).await {
                Ok(obj) => match cli.output {
                    Output::Human => println!("{}", serde_json::to_string_pretty(&obj)?),
                    Output::Json => println!("{}", serde_json::to_string(&obj)?),
                },
                Err(e) => {
                    error!(error = %e, "get failed");
                    return Err(e).with_context(|| format!("fetching {} {}", gvk, target));
                }
            }
        }
    }

    Ok(())
}
