//! mlisp compiler CLI.
//!
//! Compiles the runtime library plus the given source files into
//! `program.hex` and `program.lst`. Failures print a one-line
//! `Compile error:` diagnostic and exit with status 1.

use clap::Parser as ClapParser;
use mlispc::CompilerConfig;
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "mlispc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "mlisp compiler - compile mlisp sources to a stack-machine hex image", long_about = None)]
struct Cli {
    /// Input source files, compiled after the runtime library
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Output hex image path (defaults to program.hex)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Listing output path (defaults to program.lst)
    #[arg(long)]
    listing: Option<PathBuf>,

    /// Runtime library path (defaults to runtime.lisp beside the compiler)
    #[arg(long)]
    runtime: Option<PathBuf>,

    /// Disable constant folding and strength reduction
    #[arg(long)]
    no_optimize: bool,

    /// Compiler configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    // Set up logging; diagnostics for users go to stdout, tracing to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match CompilerConfig::from_toml_file(path) {
            Ok(config) => config,
            Err(e) => {
                println!("Compile error: {}", e);
                process::exit(1);
            }
        },
        None => CompilerConfig::new(),
    };

    // Command-line switches win over the configuration file.
    if let Some(output) = cli.output {
        config.hex_path = output;
    }
    if let Some(listing) = cli.listing {
        config.listing_path = listing;
    }
    if let Some(runtime) = cli.runtime {
        config.runtime_path = Some(runtime);
    }
    if cli.no_optimize {
        config.optimize = false;
    }

    if let Err(e) = mlispc::compile_files(&cli.files, &config) {
        println!("Compile error: {}", e);
        process::exit(1);
    }
}
