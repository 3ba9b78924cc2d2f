//! One-shot build command: `bskit build`.

use anyhow::Result;
use console::style;
use std::path::Path;

use bskit::config::BskitToml;
use bskit::service::BuildService;
use bskit_common::{LogEvent, LogStream, Platform, SessionState};

/// Run one build in-process and stream its log to the terminal.
/// Returns whether the build succeeded. Ctrl-C cancels the build.
pub async fn cmd_build(
    config: &BskitToml,
    directory: &Path,
    platform: Option<&str>,
    timeout: Option<u64>,
) -> Result<bool> {
    let mut config = config.clone();
    if let Some(secs) = timeout {
        config.session.timeout_secs = Some(secs);
    }
    let service = BuildService::from_config(&config)?;

    let platform = platform
        .map(str::to_string)
        .unwrap_or_else(|| Platform::host().to_string());
    let directory = directory.to_string_lossy();

    let id = service.start_build(&directory, &platform).await?;
    let mut logs = service.subscribe_logs(id)?;

    println!(
        "{} {} ({})",
        style("Building").bold().cyan(),
        directory,
        platform
    );

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = logs.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            result = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if result.is_ok() {
                    eprintln!("{}", style("Cancelling build...").yellow());
                    service.cancel_build(id)?;
                }
            }
        }
    }

    if logs.is_truncated() {
        eprintln!(
            "{} {} log lines were not shown",
            style("⚠").yellow(),
            logs.skipped()
        );
    }

    let status = service.wait(id).await?;
    if let Some(failure) = &status.failure
        && let Some(code) = failure.exit_code
    {
        eprintln!("{} exit code {}", style("Error:").red().bold(), code);
    }
    Ok(status.state == SessionState::Succeeded)
}

fn print_event(event: &LogEvent) {
    match (event.stream, event.outcome) {
        (LogStream::Stdout, _) => println!("{}", event.text),
        (LogStream::Stderr, _) => eprintln!("{}", event.text),
        (LogStream::System, Some(SessionState::Succeeded)) => {
            println!("{} {}", style("✓").green().bold(), style(&event.text).green().bold())
        }
        (LogStream::System, Some(SessionState::Cancelled)) => {
            println!("{}", style(&event.text).yellow().bold())
        }
        (LogStream::System, Some(_)) => {
            println!("{} {}", style("✗").red().bold(), style(&event.text).red().bold())
        }
        (LogStream::System, None) => println!("{}", style(&event.text).dim()),
    }
}
