use std::path::PathBuf;

use anyhow::Context;
use pisyncd::config::SyncSettings;
use pisyncd::daemon::{DaemonRuntime, summarize_report};
use pisyncd::logging::init_logging;
use pisyncd::sync::engine::SyncReport;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    SyncAll,
    Pull,
    Push(PathBuf),
    Exec(String),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sync-all" => mode = CliMode::SyncAll,
            "--pull" => mode = CliMode::Pull,
            "--push" => {
                let path = args.next().context("--push needs a path")?;
                mode = CliMode::Push(PathBuf::from(path));
            }
            "--exec" => {
                let command = args.next().context("--exec needs a command")?;
                mode = CliMode::Exec(command);
            }
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn print_usage() {
    println!("Usage: pisyncd [--sync-all | --pull | --push <path> | --exec <command>]");
    println!("  (no flag)          Follow change notifications on stdin until Ctrl-C");
    println!("  --sync-all         Push every pending change and exit");
    println!("  --pull             Download the remote tree and exit");
    println!("  --push <path>      Upload a file or directory and exit");
    println!("  --exec <command>   Run a command on the remote and exit with its code");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }

    let logging = init_logging();
    let settings = SyncSettings::load().context("failed to load settings")?;
    let daemon = DaemonRuntime::bootstrap(settings, logging.log_path().cloned()).await?;

    let code = match mode {
        CliMode::Run => {
            daemon.run().await?;
            return Ok(());
        }
        CliMode::SyncAll => print_report("push", daemon.sync_all().await?),
        CliMode::Pull => print_report("pull", daemon.pull().await?),
        CliMode::Push(path) => print_report("force push", daemon.push(&path).await?),
        CliMode::Exec(command) => daemon.exec(&command).await?,
        CliMode::Help => 0,
    };
    daemon.shutdown().await;
    drop(logging);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Prints the summary and returns the process exit code.
fn print_report(action: &str, report: SyncReport) -> i32 {
    println!("{}", summarize_report(action, &report));
    if report.failed > 0 { 1 } else { 0 }
}
