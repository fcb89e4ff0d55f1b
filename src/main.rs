use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use slotwatch::core::MailComposer;
use slotwatch::mail::create_mailer;
use slotwatch::{Config, MailSender, Monitor};

/// Watches an appointment portal for free slots on behalf of several people.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Configuration file.
    #[arg(long, short = 'c', default_value = "config.yml")]
    config: PathBuf,

    /// Seconds between two rounds; 0 runs a single round.
    #[arg(long, short = 'r', default_value_t = 0)]
    retry: u64,

    /// Send a test mail to this address and exit.
    #[arg(long = "test-mail", value_name = "RECIPIENT")]
    test_mail: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .filter_module("selectors", log::LevelFilter::Warn)
        .filter_module("html5ever", log::LevelFilter::Error)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if let Some(recipient) = cli.test_mail {
        let mailer = create_mailer(&config.mail)?;
        let mail = MailComposer::new(config.mail.signature.as_str()).compose_test(&recipient);
        mailer.send(&mail).await?;
        info!("Test mail sent to {}", recipient);
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        "Monitoring {} part{} (retry={}s)",
        config.parties.len(),
        if config.parties.len() == 1 { "y" } else { "ies" },
        cli.retry
    );
    let mut monitor = Monitor::from_config(&config, Duration::from_secs(cli.retry))
        .await
        .context("starting the monitor")?;

    let finished = tokio::select! {
        _ = monitor.run() => true,
        _ = tokio::signal::ctrl_c() => false,
    };
    if !finished {
        warn!("Interrupted, shutting down");
        monitor.shutdown().await;
    }

    // Exit status reflects the last round that completed.
    if monitor.last_report().is_some_and(|report| report.found_slot()) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}
