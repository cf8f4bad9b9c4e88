//! Command-line driver around [`zucchini::generator`] and [`zucchini::applier`].
//! File I/O and process exit codes live here; the engine itself never touches
//! a filesystem.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use zucchini::status::StatusCode;

#[derive(Debug, Parser)]
#[command(about = "Generate and apply ensemble-aware binary patches")]
struct Args {
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Debug, Subcommand)]
enum Operation {
    /// Diff `old` against `new`, writing the resulting patch.
    Gen(GenArgs),
    /// Apply `patch` to `old`, writing the reconstructed image.
    Apply(ApplyArgs),
}

#[derive(Debug, Parser)]
struct GenArgs {
    old: PathBuf,
    new: PathBuf,
    patch: PathBuf,
    /// Literal `o+os=n+ns,...` element matches, overriding automatic detection.
    #[arg(long)]
    imposed: Option<String>,
}

#[derive(Debug, Parser)]
struct ApplyArgs {
    old: PathBuf,
    patch: PathBuf,
    new: PathBuf,
}

fn run() -> Result<StatusCode> {
    let args = Args::parse();
    match &args.operation {
        Operation::Gen(gen_args) => run_gen(gen_args),
        Operation::Apply(apply_args) => run_apply(apply_args),
    }
}

fn run_gen(args: &GenArgs) -> Result<StatusCode> {
    let old = fs::read(&args.old).with_context(|| format!("reading old image {}", args.old.display()))?;
    let new = fs::read(&args.new).with_context(|| format!("reading new image {}", args.new.display()))?;

    let patch = zucchini::generator::generate(&old, &new, args.imposed.as_deref())?;

    fs::write(&args.patch, patch).with_context(|| format!("writing patch {}", args.patch.display()))?;
    Ok(StatusCode::Success)
}

fn run_apply(args: &ApplyArgs) -> Result<StatusCode> {
    let old = fs::read(&args.old).with_context(|| format!("reading old image {}", args.old.display()))?;
    let patch_bytes = fs::read(&args.patch).with_context(|| format!("reading patch {}", args.patch.display()))?;

    let new = zucchini::applier::apply(&old, &patch_bytes)?;

    fs::write(&args.new, new).with_context(|| format!("writing new image {}", args.new.display()))?;
    Ok(StatusCode::Success)
}

fn main() -> ExitCode {
    match run() {
        Ok(status) => ExitCode::from(status.exit_code() as u8),
        Err(err) => {
            eprintln!("error: {err:?}");
            ExitCode::from(StatusCode::FatalError.exit_code() as u8)
        }
    }
}
