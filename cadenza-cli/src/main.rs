use anyhow::Context;
use cadenza_core::environment::Environment;
use cadenza_engine::{parse_plan_file, Orchestrator, RunOptions, Update, UpdateKind};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::thread;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow plan file
    Run {
        /// The path to the plan file
        file: PathBuf,
        /// Print provider traffic and per-step timing
        #[arg(long)]
        verbose: bool,
        /// Subdirectory under the data directory for this run's outputs
        #[arg(long)]
        runtime_dir: Option<String>,
        /// Base directory for resolved output paths
        #[arg(long)]
        server_data_dir: Option<PathBuf>,
        /// Environment file naming providers, models, and databases
        #[arg(long)]
        env: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            verbose,
            runtime_dir,
            server_data_dir,
            env,
        } => {
            if let Err(error) = run_plan(file, verbose, runtime_dir, server_data_dir, env) {
                eprintln!("Error: {}", error);
                process::exit(1);
            }
        }
    }
}

fn run_plan(
    file: PathBuf,
    verbose: bool,
    runtime_dir: Option<String>,
    server_data_dir: Option<PathBuf>,
    env: Option<PathBuf>,
) -> anyhow::Result<()> {
    let environment =
        Environment::load(env.as_deref()).context("failed to load the environment file")?;
    let plan = parse_plan_file(&file)?;
    let options = RunOptions {
        verbose,
        server_data_dir,
        runtime_dir,
    };

    let (sender, receiver) = crossbeam_channel::unbounded::<Update>();
    let printer = thread::spawn(move || {
        for update in receiver {
            print_update(&update, verbose);
        }
    });

    let result = {
        let mut orchestrator =
            Orchestrator::new(plan, environment, options).with_progress(sender);
        orchestrator.execute()
        // Dropping the orchestrator closes the channel and stops the printer.
    };
    let _ = printer.join();

    result?;
    Ok(())
}

fn print_update(update: &Update, verbose: bool) {
    let name = update.step_name.as_deref().unwrap_or("?");
    match update.kind {
        UpdateKind::Spinner => {
            if verbose {
                eprintln!("{}", update.message);
            }
        }
        UpdateKind::Step => {
            println!("Running step '{}'...", name);
        }
        UpdateKind::ParallelStep => {
            let group = update.parallel_id.as_deref().unwrap_or("parallel");
            println!("Running step '{}' [{}]...", name, group);
        }
        UpdateKind::Output => {
            let model = update.model.as_deref().unwrap_or("model");
            let text = update.stdout.as_deref().unwrap_or("");
            println!("Response from {}:\n{}", model, text);
        }
        UpdateKind::Complete => {
            if verbose {
                if let Some(metrics) = &update.metrics {
                    eprintln!("Step '{}' complete ({})", name, metrics.summary());
                    return;
                }
            }
            println!("Step '{}' complete.", name);
        }
        UpdateKind::Error => {
            eprintln!("{}", update.message);
        }
    }
}
