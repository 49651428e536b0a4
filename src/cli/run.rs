//! `marge run` and `marge check-config`

use crate::cli::context::BotContext;
use crate::cli::style::Stylize;
use anstream::println;
use marge_bot::config::BotConfig;
use marge_bot::error::Result;
use marge_bot::merge::{CycleReport, RequestOutcome, run_cycle};
use marge_bot::platform::PlatformService;
use tracing::{error, info};

/// Options for the run command
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stop after a single cycle
    pub once: bool,
}

/// Poll for assigned merge requests and merge them until interrupted
pub async fn run_bot(config: &BotConfig, options: RunOptions) -> Result<()> {
    let ctx = BotContext::new(config).await?;
    let interval = config.cycle_interval();

    loop {
        match run_once(&ctx).await {
            Ok(report) => print_report(&report),
            Err(e) if options.once => return Err(e),
            // Infrastructure hiccups should not kill a long-running bot
            Err(e) => error!(error = %e, "cycle failed"),
        }
        if options.once {
            return Ok(());
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                return Ok(());
            }
        }
    }
}

async fn run_once(ctx: &BotContext) -> Result<CycleReport> {
    let candidates = ctx
        .platform
        .search_merge_requests(&ctx.candidates_query())
        .await?;
    info!(count = candidates.len(), "fetched assigned merge requests");
    run_cycle(
        &ctx.platform,
        &ctx.git,
        &ctx.user,
        &ctx.project,
        &ctx.options,
        &candidates,
    )
    .await
}

fn print_report(report: &CycleReport) {
    let Some(target) = &report.target_branch else {
        println!("{}", "No merge requests assigned.".muted());
        return;
    };
    let mode = if report.batched { "batch" } else { "solo" };
    println!(
        "{} {} ({mode})",
        "Cycle on".muted(),
        target.accent()
    );
    for (request, outcome) in &report.outcomes {
        let label = format!("!{}", request.iid);
        let line = outcome.to_string();
        let line = match outcome {
            RequestOutcome::Merged { .. } => line.success(),
            RequestOutcome::Failed { .. } => line.error(),
            RequestOutcome::Evicted { .. } | RequestOutcome::Errored { .. } => line.warn(),
            RequestOutcome::Deferred => line.muted(),
        };
        println!("  {} {}: {line}", label.accent(), request.title);
    }
}

/// Load the config and try the token and project, without merging anything
pub async fn check_config(config: &BotConfig) -> Result<()> {
    let ctx = BotContext::new(config).await?;
    println!(
        "{} {} on {} as {}",
        "OK".success(),
        ctx.project.path_with_namespace.accent(),
        config.gitlab_url,
        ctx.user.username.accent()
    );
    let options = &ctx.options;
    println!(
        "  {} fusion={} batch={} ci_timeout={}s attempts={}",
        "job:".muted(),
        options.fusion,
        options.batch,
        options.ci_timeout.as_secs(),
        options.max_attempts
    );
    Ok(())
}
