//! Subcommand handlers
//!
//! Each handler returns the process exit code. Failures are printed to stderr with
//! their full context chain.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use super::commands::{
    AuditArgs, ConsentAction, DownloadArgs, ModelArgs, ModelsArgs, PrivacyAction, RunArgs,
};
use super::output::{OutputFormat, OutputFormatter};
use crate::audit::AuditFilter;
use crate::config::RuntimeConfig;
use crate::download::DownloadStatus;
use crate::inference::InferenceRequest;
use crate::ipc;
use crate::routing::PolicyUpdate;
use crate::runtime::{Dispatch, RunOutcome, Runtime};

/// Exit code when routing refused the request
pub const EXIT_DENIED: i32 = 3;

fn open_runtime() -> Result<Runtime> {
    let config = RuntimeConfig::default();
    debug!("{}", config);
    Runtime::open(config).context("Failed to initialize the runtime")
}

fn report(result: Result<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

fn emit(output: String) {
    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }
}

pub async fn handle_detect(format: OutputFormat) -> i32 {
    report(run_detect(format))
}

fn run_detect(format: OutputFormat) -> Result<i32> {
    let runtime = open_runtime()?;
    let caps = runtime
        .detect_capabilities()
        .context("Capability detection failed")?;
    emit(OutputFormatter::new(format).format_capabilities(&caps)?);
    Ok(0)
}

pub async fn handle_models(args: &ModelsArgs, format: OutputFormat) -> i32 {
    report(run_models(args, format))
}

fn run_models(args: &ModelsArgs, format: OutputFormat) -> Result<i32> {
    let runtime = open_runtime()?;
    let formatter = OutputFormatter::new(format);
    let output = if args.local {
        formatter.format_local_models(&runtime.local_models())?
    } else if args.recommended {
        formatter.format_models(&runtime.recommend()?)?
    } else {
        formatter.format_models(&runtime.list_models(args.all)?)?
    };
    emit(output);
    Ok(0)
}

pub async fn handle_download(args: &DownloadArgs, format: OutputFormat, quiet: bool) -> i32 {
    report(run_download(args, format, quiet).await)
}

async fn run_download(args: &DownloadArgs, format: OutputFormat, quiet: bool) -> Result<i32> {
    let runtime = open_runtime()?;
    let mut progress = runtime.start_download(&args.model_id)?;

    let bar = if quiet || args.no_progress || format != OutputFormat::Human {
        None
    } else {
        let bar = ProgressBar::new(progress.current().total_bytes);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {msg:<12} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .context("Invalid progress template")?
            .progress_chars("=> "),
        );
        Some(bar)
    };

    let mut last = progress.current();
    while let Some(state) = progress.next().await {
        if let Some(bar) = &bar {
            bar.set_length(state.total_bytes);
            bar.set_position(state.bytes_downloaded);
            bar.set_message(state.status.to_string());
        }
        last = state;
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    emit(OutputFormatter::new(format).format_download(&last)?);
    Ok(if last.status == DownloadStatus::Complete {
        0
    } else {
        1
    })
}

pub async fn handle_remove(args: &ModelArgs) -> i32 {
    report(run_remove(args).await)
}

async fn run_remove(args: &ModelArgs) -> Result<i32> {
    let runtime = open_runtime()?;
    if runtime.remove_model(&args.model_id).await? {
        println!("\u{2713} Removed {}", args.model_id);
        Ok(0)
    } else {
        eprintln!("{} is not downloaded", args.model_id);
        Ok(1)
    }
}

pub async fn handle_run(args: &RunArgs, format: OutputFormat) -> i32 {
    report(run_inference(args, format).await)
}

async fn run_inference(args: &RunArgs, format: OutputFormat) -> Result<i32> {
    let runtime = open_runtime()?;
    let stream = !args.no_stream && format == OutputFormat::Human;
    let request = InferenceRequest::new(args.model_id.as_str(), args.prompt.as_str())
        .with_max_tokens(args.max_tokens)
        .with_temperature(args.temperature)
        .with_top_p(args.top_p)
        .with_stop_sequences(args.stop_sequences.clone())
        .streaming(stream);

    let outcome = match runtime.begin_inference(request).await? {
        Dispatch::Local(routed) => {
            let cancel = routed.session.cancel_handle();
            let watcher = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let decision = routed.decision.clone();
            let mut stdout = io::stdout();
            let response = runtime
                .stream_local(routed, |token| {
                    if stream {
                        let _ = write!(stdout, "{}", token.token);
                        let _ = stdout.flush();
                    }
                })
                .await?;
            watcher.abort();

            RunOutcome {
                decision,
                response: Some(response),
            }
        }
        Dispatch::External { decision, response } => {
            if stream {
                print!("{}", response.text);
            }
            RunOutcome {
                decision,
                response: Some(response),
            }
        }
        Dispatch::Denied(decision) => RunOutcome {
            decision,
            response: None,
        },
    };

    let summary = OutputFormatter::new(format).format_run(&outcome, stream)?;
    if outcome.response.is_none() {
        eprint!("{}", summary);
        return Ok(EXIT_DENIED);
    }
    emit(summary);

    let failed = outcome
        .response
        .as_ref()
        .map_or(false, |response| response.error.is_some());
    Ok(if failed { 1 } else { 0 })
}

pub async fn handle_audit(args: &AuditArgs, format: OutputFormat) -> i32 {
    report(run_audit(args, format))
}

fn run_audit(args: &AuditArgs, format: OutputFormat) -> Result<i32> {
    let runtime = open_runtime()?;
    let filter = AuditFilter {
        session_id: args.session.clone(),
        event_type: args.event,
        limit: args.limit,
        ..Default::default()
    };
    emit(OutputFormatter::new(format).format_audit(&runtime.query_audit(&filter))?);
    Ok(0)
}

pub async fn handle_audit_purge() -> i32 {
    report(run_audit_purge())
}

fn run_audit_purge() -> Result<i32> {
    let runtime = open_runtime()?;
    let retention = runtime.privacy_policy().data_retention_days;
    let removed = runtime.purge_audit().context("Audit purge failed")?;
    println!(
        "\u{2713} Removed {} audit entr{} older than {} day(s)",
        removed,
        if removed == 1 { "y" } else { "ies" },
        retention
    );
    Ok(0)
}

pub async fn handle_privacy(action: &PrivacyAction, format: OutputFormat) -> i32 {
    report(run_privacy(action, format))
}

fn run_privacy(action: &PrivacyAction, format: OutputFormat) -> Result<i32> {
    let runtime = open_runtime()?;
    let formatter = OutputFormatter::new(format);
    let policy = match action {
        PrivacyAction::Show => runtime.privacy_policy(),
        PrivacyAction::Set(set) => {
            let update = PolicyUpdate {
                local_processing_only: set.local_only,
                auditing_enabled: set.auditing,
                data_retention_days: set.retention_days,
            };
            if update.is_empty() {
                bail!("Nothing to change: pass --local-only, --auditing or --retention-days");
            }
            runtime
                .update_privacy_policy(&update)
                .context("Privacy policy update rejected")?
        }
    };
    emit(formatter.format_policy(&policy)?);
    Ok(0)
}

pub async fn handle_consent(action: &ConsentAction, format: OutputFormat) -> i32 {
    report(run_consent(action, format))
}

fn run_consent(action: &ConsentAction, format: OutputFormat) -> Result<i32> {
    let runtime = open_runtime()?;
    let formatter = OutputFormatter::new(format);
    match action {
        ConsentAction::Grant { prompt } => {
            let record = runtime.grant_consent(prompt.as_deref())?;
            emit(formatter.format_consents(&[record])?);
        }
        ConsentAction::Revoke { scope, prompt } => {
            let removed = runtime.revoke_consent((*scope).into(), prompt.as_deref())?;
            println!("\u{2713} Revoked {} consent record(s)", removed);
        }
        ConsentAction::List => emit(formatter.format_consents(&runtime.consents())?),
    }
    Ok(0)
}

pub async fn handle_config(format: OutputFormat) -> i32 {
    report(run_config(format))
}

fn run_config(format: OutputFormat) -> Result<i32> {
    let config = RuntimeConfig::default();
    if let Err(e) = config.validate() {
        eprintln!("\u{26A0} {}", e);
    }
    emit(OutputFormatter::new(format).format_config(&config)?);
    Ok(0)
}

pub async fn handle_serve() -> i32 {
    report(run_serve().await)
}

async fn run_serve() -> Result<i32> {
    let runtime = Arc::new(open_runtime()?);
    ipc::serve_stdio(runtime)
        .await
        .context("JSON-RPC transport failed")?;
    Ok(0)
}
