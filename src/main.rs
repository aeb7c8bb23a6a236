mod cli;

use crate::cli::Cli;
use clap::Parser;
use comicup_config::Config;
use comicup_inference::ProcessUpscaler;
use comicup_pipeline::{ComicPipeline, Summary};
use derive_more::{Display, Error};
use exn::ResultExt;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Exit code for errors that stop the run before any archive is processed.
const FATAL_EXIT_CODE: u8 = 2;

type Error = exn::Exn<ErrorKind>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
enum ErrorKind {
    #[display("cannot load configuration")]
    Config,
    #[display("upscaler is not available")]
    Upscaler,
    #[display("run aborted")]
    Pipeline,
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing the current batch");
            token.cancel();
        }
    });
    cancel
}

async fn run(cli: Cli) -> Result<Summary, Error> {
    let figment = Config::figment(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let config = Config::extract(&cli.apply(figment)).or_raise(|| ErrorKind::Config)?;
    let upscaler =
        ProcessUpscaler::discover(config.inference.executable.as_deref(), config.inference.models_dir.as_deref())
            .or_raise(|| ErrorKind::Upscaler)?;
    let pipeline = ComicPipeline::new(&config, Arc::new(upscaler)).or_raise(|| ErrorKind::Pipeline)?;
    let cancel = cancel_on_interrupt();
    pipeline.run_on_path(&cli.path, &cancel).await.or_raise(|| ErrorKind::Pipeline)
}

fn report(summary: &Summary) {
    for (archive, failure) in summary.failures() {
        eprintln!("failed: {}: {failure}", archive.display());
    }
    println!("{summary}");
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli).await {
        Ok(summary) => {
            report(&summary);
            ExitCode::from(summary.exit_code())
        },
        Err(err) => {
            eprintln!("error: {err:?}");
            ExitCode::from(FATAL_EXIT_CODE)
        },
    }
}
