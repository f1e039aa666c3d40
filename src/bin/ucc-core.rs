//! ucc-core CLI
//!
//! Compile and run one certification test case.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use ucc_core::{parse_assignment, Engine, RunConfig, Runner};

#[derive(Parser, Debug)]
#[command(name = "ucc-core")]
#[command(version)]
#[command(about = "Run a certification test script against a Wi-Fi testbed")]
struct Cli {
    /// Test-case script
    script: Option<PathBuf>,

    /// Directory searched for included files (repeatable)
    #[arg(short = 'I', long = "include")]
    include_dirs: Vec<PathBuf>,

    /// Certification program (PMF, WPA3, VHT, HE, ...)
    #[arg(short, long, default_value = "")]
    program: String,

    /// Default response timeout in seconds
    #[arg(long, default_value_t = 240)]
    socket_timeout: u64,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Do not ping devices before sending commands
    #[arg(long)]
    no_probe: bool,

    /// File name compiled as a feature-info file
    #[arg(long)]
    feature_file: Option<String>,

    /// Wait for the operator on `pause`
    #[arg(long)]
    interactive: bool,

    /// Variable bound before compilation (KEY=VALUE, repeatable)
    #[arg(short = 'D', long = "define")]
    defines: Vec<String>,

    /// Access point active in this test case (repeatable)
    #[arg(long = "active-ap")]
    active_aps: Vec<String>,

    /// Print the command list and execution queue, then exit
    #[arg(long)]
    compile_only: bool,

    /// Print the execution log after the run
    #[arg(short, long)]
    verbose: bool,

    /// List available local actions
    #[arg(long = "list-actions")]
    list_actions: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.list_actions {
        print_actions();
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the test case passed.
fn run(cli: Cli) -> anyhow::Result<bool> {
    let script = cli
        .script
        .context("a test-case script is required")?;
    let variables = cli
        .defines
        .iter()
        .map(|d| parse_assignment(d))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid --define")?;

    let config = RunConfig {
        script: script.clone(),
        include_dirs: cli.include_dirs,
        program: cli.program,
        socket_timeout: Duration::from_secs(cli.socket_timeout),
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        probe: !cli.no_probe,
        feature_file: cli.feature_file,
        interactive: cli.interactive,
        variables,
        active_aps: cli.active_aps,
        ..Default::default()
    };
    let runner = Runner::new(config);

    if cli.compile_only {
        let compiled = runner
            .compile_only()
            .with_context(|| format!("compiling {}", script.display()))?;
        print!("{}", compiled);
        return Ok(true);
    }

    let report = runner
        .run()
        .with_context(|| format!("running {}", script.display()))?;

    if cli.verbose && !report.log.is_empty() {
        for line in report.log.lines() {
            println!("      {}", line);
        }
    }
    for info in &report.validation {
        println!(
            "      {}: vendor={} model={} version={}",
            info.device, info.vendor, info.model, info.version
        );
    }
    if let Some(reason) = &report.stop_reason {
        println!("      stopped: {}", reason);
    }
    println!("{} ({}ms)", report.summary(), report.duration.as_millis());
    Ok(report.passed())
}

fn print_actions() {
    println!("Local actions:");
    println!();
    for (name, args, summary) in Engine::new().action_help() {
        println!("  {:<18} {} {}", name, summary, args);
    }
}
