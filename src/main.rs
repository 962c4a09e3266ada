use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use colored::*;
use log::{error, info, LevelFilter};

use datahub_downloader::cli::Cli;
use datahub_downloader::client::{ApiClient, ServiceConfig};
use datahub_downloader::query::Format;
use datahub_downloader::report::Reporter;
use datahub_downloader::sched::{Scheduler, OUTPUT_FORMATS};
use datahub_downloader::{plan, split};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();
    info!("starting catalog dump");

    // fail fast before any network traffic
    let meta = std::fs::metadata(&cli.output)
        .with_context(|| format!("cannot dump to {}: path does not exist", cli.output.display()))?;
    anyhow::ensure!(
        meta.is_dir(),
        "cannot dump to {}: not a directory",
        cli.output.display()
    );
    if let Some(page_size) = cli.json_pages {
        anyhow::ensure!(page_size > 0, "--json-pages must be at least 1");
    }

    let client = ApiClient::new(&ServiceConfig {
        server: cli.server.clone(),
        version: cli.api_version.clone(),
        client_id: cli.clientid.clone(),
        secret: cli.secret.clone(),
    })?;

    let tasks = plan::build_plan(Local::now().date_naive());
    info!("planned {} tasks", tasks.len());

    client
        .credentials()
        .start()
        .await
        .context("authentication failed, aborting before any task runs")?;

    let scheduler = Scheduler::new(
        tasks,
        cli.output.clone(),
        cli.max_open,
        Duration::from_millis(cli.time_between),
    );
    let mut reporter = Reporter::new(scheduler.task_count(), &OUTPUT_FORMATS);
    scheduler.run(&client, &mut reporter).await;

    // run() is work-complete: no in-flight stream outlives it
    client.credentials().stop();

    let report_path = cli.output.join(format!("{}.csv", cli.report_name));
    reporter.write_csv(&report_path)?;
    info!("report written to {}", report_path.display());

    if let Some(page_size) = cli.json_pages {
        split_json_dumps(&cli, &reporter, page_size).await;
    }

    print_summary(&reporter);

    let failed = reporter.failures().count();
    if failed > 0 {
        error!("{failed} fetches failed");
        anyhow::bail!("{} of {} fetches failed", failed, reporter.records().len());
    }
    Ok(())
}

async fn split_json_dumps(cli: &Cli, reporter: &Reporter, page_size: usize) {
    for outcome in reporter.records() {
        if !outcome.is_ok() || outcome.format != Format::Json {
            continue;
        }
        let input = cli.output.join(format!("{}.json", outcome.task_key));
        let out_dir = cli.output.join(format!("{}-pages", outcome.task_key));
        let name = outcome.task_key.rsplit('/').next().unwrap_or("");
        if let Err(e) = split::split_array(&input, &out_dir, &format!("{name}-"), page_size).await {
            error!("cannot split {}: {e}", input.display());
        }
    }
}

fn print_summary(reporter: &Reporter) {
    let total = reporter.records().len();
    let failed = reporter.failures().count();
    let succeeded = total - failed;
    let bytes: i64 = reporter
        .records()
        .iter()
        .filter(|outcome| outcome.is_ok())
        .map(|outcome| outcome.byte_size)
        .sum();

    println!("\n{}", "Dump Summary:".bold());
    println!("Total fetches: {total}");
    println!("Succeeded: {}", succeeded.to_string().green());
    println!("Failed: {}", failed.to_string().red());
    println!("Total data written: {:.2} MB", bytes as f64 / 1_048_576.0);

    if failed > 0 {
        println!("\n{}", "Failed fetches:".red().bold());
        for outcome in reporter.failures() {
            println!(
                "✗ {}.{} - {}",
                outcome.task_key.red(),
                outcome.format,
                outcome.status
            );
            println!("  URI: {}", outcome.resolved_uri);
        }
    }
}
