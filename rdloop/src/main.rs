use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use rdloop::core::patch::BodyPatcher;
use rdloop::exit_codes;
use rdloop::io::challenge::Challenge;
use rdloop::io::config::{ConfigOverrides, LoopConfig, load_config};
use rdloop::io::container::DockerRuntime;
use rdloop::io::generator::CommandGenerator;
use rdloop::logging;
use rdloop::orchestrator::{Orchestrator, RunLimits, RunSummary, prepare_resume};

#[derive(Parser)]
#[command(
    name = "rdloop",
    version,
    about = "Iterative research loop for FHE challenges"
)]
struct Cli {
    /// Log progress at info level (`RUST_LOG` overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session.
    Run {
        /// TOML config; defaults apply when the file is missing.
        #[arg(long, default_value = "rdloop.toml")]
        config: PathBuf,
        #[arg(long)]
        challenge_dir: Option<PathBuf>,
        #[arg(long)]
        session_dir: Option<PathBuf>,
        #[arg(long)]
        max_loops: Option<u32>,
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Build timeout in seconds.
        #[arg(long)]
        build_timeout: Option<u64>,
        /// Per-run timeout in seconds.
        #[arg(long)]
        run_timeout: Option<u64>,
        #[arg(long)]
        accuracy_threshold: Option<f64>,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Continue a session from a checkpoint file.
    Resume {
        checkpoint: PathBuf,
        /// Keep checkpoints newer than the one resumed from.
        #[arg(long)]
        no_checkout: bool,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Print the variant, templates and identifiers of a challenge.
    Inspect {
        #[arg(long, default_value = "rdloop.toml")]
        config: PathBuf,
        #[arg(long)]
        challenge_dir: Option<PathBuf>,
    },
    /// Replace a method body in a template file and print the result.
    Patch {
        template: PathBuf,
        body_file: PathBuf,
        #[arg(long, default_value = "eval")]
        method: String,
    },
}

#[derive(Args, Clone, Copy, Debug, Default)]
struct LimitArgs {
    /// Iterations to start in this invocation.
    #[arg(long)]
    loop_n: Option<u32>,
    /// Stages to run in this invocation.
    #[arg(long)]
    step_n: Option<u64>,
}

impl From<LimitArgs> for RunLimits {
    fn from(args: LimitArgs) -> Self {
        Self {
            loop_n: args.loop_n,
            step_n: args.step_n,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match dispatch(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Run {
            config,
            challenge_dir,
            session_dir,
            max_loops,
            max_parallel,
            build_timeout,
            run_timeout,
            accuracy_threshold,
            limits,
        } => {
            let mut cfg = load_config(&config)?;
            cfg.apply(&ConfigOverrides {
                challenge_dir,
                session_dir,
                max_loops,
                max_parallel,
                build_timeout_secs: build_timeout,
                run_timeout_secs: run_timeout,
                accuracy_threshold,
            });
            cmd_run(&cfg, limits.into())
        }
        Command::Resume {
            checkpoint,
            no_checkout,
            limits,
        } => cmd_resume(&checkpoint, !no_checkout, limits.into()),
        Command::Inspect {
            config,
            challenge_dir,
        } => {
            let mut cfg = load_config(&config)?;
            cfg.apply(&ConfigOverrides {
                challenge_dir,
                ..ConfigOverrides::default()
            });
            cmd_inspect(&cfg)
        }
        Command::Patch {
            template,
            body_file,
            method,
        } => cmd_patch(&template, &body_file, &method),
    }
}

fn cmd_run(config: &LoopConfig, limits: RunLimits) -> Result<i32> {
    config.validate()?;
    let challenge = Challenge::load(&config.challenge_dir, config)?;
    let generator = CommandGenerator::new(&config.generator)?;
    let runtime = DockerRuntime::new(
        config.sandbox.container_bin.clone(),
        config.sandbox.output_limit_bytes,
    );
    let summary = Orchestrator::new(config, &challenge, &generator, &runtime)?.run(limits)?;
    report(&summary)
}

fn cmd_resume(path: &Path, checkout_later: bool, limits: RunLimits) -> Result<i32> {
    let checkpoint = prepare_resume(path, checkout_later)?;
    let config = checkpoint.config.clone();
    let challenge = Challenge::load(&config.challenge_dir, &config)?;
    let generator = CommandGenerator::new(&config.generator)?;
    let runtime = DockerRuntime::new(
        config.sandbox.container_bin.clone(),
        config.sandbox.output_limit_bytes,
    );
    let summary =
        Orchestrator::new(&config, &challenge, &generator, &runtime)?.resume(checkpoint, limits)?;
    report(&summary)
}

fn report(summary: &RunSummary) -> Result<i32> {
    println!(
        "{}",
        serde_json::to_string_pretty(summary).context("serialize summary")?
    );
    Ok(if summary.solved() {
        exit_codes::SOLVED
    } else {
        exit_codes::EXHAUSTED
    })
}

fn cmd_inspect(config: &LoopConfig) -> Result<i32> {
    let challenge = Challenge::load(&config.challenge_dir, config)?;
    println!("name: {}", challenge.name);
    println!("variant: {}", challenge.variant.as_str());
    println!("fingerprint: {}", challenge.fingerprint);
    println!("templates:");
    for (name, contents) in &challenge.templates {
        println!("  {name} ({} bytes)", contents.len());
    }
    println!("identifiers:");
    for (name, role) in challenge.identifiers.rows() {
        println!("  {name}: {role}");
    }
    Ok(exit_codes::SOLVED)
}

fn cmd_patch(template: &Path, body_file: &Path, method: &str) -> Result<i32> {
    let source =
        fs::read_to_string(template).with_context(|| format!("read {}", template.display()))?;
    let body =
        fs::read_to_string(body_file).with_context(|| format!("read {}", body_file.display()))?;
    let patcher = BodyPatcher::new(method);
    let body = patcher.strip_wrapper(&body);
    let patched = patcher.inject_body(&source, &format!("\n{body}\n"))?;
    print!("{patched}");
    Ok(exit_codes::SOLVED)
}
