use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use lc3gen::abi::{DEFAULT_FRAME_BASE, DEFAULT_ORIGIN};
use lc3gen::{CompileOptions, Op};

#[derive(Parser)]
#[command(name = "lc3gen")]
#[command(version)]
#[command(about = "Stack-machine code generator for an 8-register LC-3 style VM")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a JSON operation stream into an object file
    Compile {
        #[arg(help = "Input JSON operation stream")]
        input: PathBuf,

        #[arg(short, long, help = "Output object file")]
        output: PathBuf,

        #[arg(long, value_parser = parse_word, default_value_t = DEFAULT_ORIGIN, help = "Image load address")]
        origin: u16,

        #[arg(long, value_parser = parse_word, default_value_t = DEFAULT_FRAME_BASE, help = "Initial frame base address")]
        frame_base: u16,

        #[arg(long, help = "Print the resolved chunk listing")]
        listing: bool,
    },
    /// Print the resolved chunk listing of a JSON operation stream
    Disasm {
        #[arg(help = "Input JSON operation stream")]
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            input,
            output,
            origin,
            frame_base,
            listing,
        } => {
            let ops = read_ops(&input)?;
            let options = CompileOptions { origin, frame_base };

            let program = lc3gen::compile(&ops, &options).context("Compilation failed")?;
            if listing {
                print!("{}", program.listing());
            }
            let image = program
                .assemble(options.origin)
                .context("Assembly failed")?;
            let encoded = image.to_object_bytes();
            fs::write(&output, &encoded)
                .with_context(|| format!("Failed to write output to {}", output.display()))?;
            tracing::info!(
                code_words = image.code_len(),
                words = image.words().len(),
                "compiled {}",
                input.display()
            );
            println!(
                "Compiled {} -> {} ({} bytes)",
                input.display(),
                output.display(),
                encoded.len()
            );
        }
        Commands::Disasm { input } => {
            let ops = read_ops(&input)?;
            let program = lc3gen::compile(&ops, &CompileOptions::default())
                .context("Compilation failed")?;
            print!("{}", program.listing());
        }
    }

    Ok(())
}

fn read_ops(path: &Path) -> Result<Vec<Op>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse operation stream {}", path.display()))
}

/// Accept decimal or `0x`-prefixed hex.
fn parse_word(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}
