// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command line front end for running reset and power cycling campaigns.

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use cycler::CyclingCampaign;
use cycler::ResetEngine;
use cycler::ResetKind;
use cycler::clock::SystemClock;
use cycler::config::CyclerConfig;
use cycler::summary::CyclingSummary;
use cycler::summary::LedgerStatus;
use cycler::sut::Sut;
use cycler::sut::ipmi::IpmiPowerControl;
use cycler::sut::probe::CommandPostCodeReader;
use cycler::sut::probe::CommandSiliconDebug;
use cycler::sut::ssh::SshSut;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

const REPORT_FILE: &str = "cycling_report.json";

#[derive(Parser)]
#[command(about = "Reset and power cycling for platform validation", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a cycling campaign against the configured SUT.
    Run {
        /// JSON configuration file.
        #[arg(long)]
        config: PathBuf,
        /// Transition to cycle. Overrides the configuration.
        #[arg(long)]
        kind: Option<ResetKind>,
        /// Number of cycles. Overrides the configuration.
        #[arg(long)]
        cycles: Option<u32>,
        /// Directory for logs, evidence, and the cycling summary.
        #[arg(long, default_value = "cycler-logs")]
        log_dir: PathBuf,
    },
    /// Print the totals of an existing cycling summary.
    Summary {
        /// Path to `cycling_summary.csv`.
        path: PathBuf,
    },
    /// Validate a configuration file without touching the SUT.
    CheckConfig {
        /// JSON configuration file.
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    match Cli::parse().command {
        Command::Run {
            config,
            kind,
            cycles,
            log_dir,
        } => run(&config, kind, cycles, &log_dir),
        Command::Summary { path } => summary(&path),
        Command::CheckConfig { config } => {
            let config = load(&config)?;
            println!(
                "ok: {} ({:?}), {} cycles",
                config.sut.host, config.sut.os, config.cycling.cycles
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load(path: &Path) -> anyhow::Result<CyclerConfig> {
    CyclerConfig::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn run(
    config_path: &Path,
    kind: Option<ResetKind>,
    cycles: Option<u32>,
    log_dir: &Path,
) -> anyhow::Result<ExitCode> {
    let logs = cycler::try_init_tracing(log_dir)?;
    let config = load(config_path)?;
    let kind = kind
        .or(config.cycling.kind)
        .context("no reset kind given on the command line or in the configuration")?;
    let cycles = cycles.unwrap_or(config.cycling.cycles);

    let mut sut = Sut::new(
        Box::new(SshSut::from_config(&config.sut)),
        Box::new(IpmiPowerControl::from_config(&config.power)?),
    );
    if let Some(probe) = &config.post_code {
        sut = sut.with_post_codes(Box::new(CommandPostCodeReader::from_config(probe)));
    }
    if let Some(probe) = &config.silicon_debug {
        sut = sut.with_silicon_debug(Box::new(CommandSiliconDebug::from_config(probe)));
    }

    let engine = ResetEngine::new(sut, config.cycling, Box::new(SystemClock::new()));
    let mut campaign = CyclingCampaign::new(engine, logs.clone())?;
    campaign.prepare(kind);
    let report = campaign
        .run(kind, cycles)
        .context("cycling campaign aborted")?;

    logs.write_attachment(REPORT_FILE, serde_json::to_vec_pretty(&report)?)?;
    tracing::info!(
        path = %logs.root().join(REPORT_FILE).display(),
        passed = report.passed(),
        "wrote campaign report"
    );

    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn summary(path: &Path) -> anyhow::Result<ExitCode> {
    let rows = CyclingSummary::read(path)?;
    let failed: Vec<_> = rows
        .iter()
        .filter(|row| row.status == LedgerStatus::Failed)
        .collect();
    println!(
        "{} cycles, {} succeeded, {} failed",
        rows.len(),
        rows.len() - failed.len(),
        failed.len()
    );
    for row in &failed {
        println!("  cycle {}: {}", row.cycle, row.remarks);
    }
    Ok(if failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
