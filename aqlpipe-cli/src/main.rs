mod display;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use aqlpipe::{
    CompilerOptions, MemoryDatabase, PipelineCompiler, RandomSource, Repository, SeededRandom,
    StageValidator, ThreadRandom,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aqlpipe", about = "Compile aggregation pipelines into AQL")]
struct Cli {
    /// Seed for `$sample` defaults (reproducible output)
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Placeholder raw expressions use for the current document
    #[arg(long, global = true)]
    placeholder: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the AQL generated for a pipeline
    Compile {
        collection: String,
        /// Pipeline JSON, or @path to read it from a file
        pipeline: String,
    },
    /// Run a pipeline against an in-memory database
    Run {
        collection: String,
        /// Pipeline JSON, or @path to read it from a file
        pipeline: String,
        /// JSON file of the form {"collection": [documents]}
        #[arg(long)]
        data: Option<PathBuf>,
        /// Output raw JSON (no pretty-printing)
        #[arg(long)]
        json: bool,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let compiler = match build_compiler(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let outcome = match &cli.command {
        Command::Compile {
            collection,
            pipeline,
        } => compile(&compiler, collection, pipeline),
        Command::Run {
            collection,
            pipeline,
            data,
            json,
        } => run(compiler, collection, pipeline, data.as_ref(), *json).await,
    };

    match outcome {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn build_compiler(cli: &Cli) -> CliResult<PipelineCompiler> {
    let mut options = CompilerOptions::from_env()?;
    if let Some(placeholder) = &cli.placeholder {
        options.placeholder = placeholder.clone();
    }
    let random: Arc<dyn RandomSource> = match cli.seed {
        Some(seed) => Arc::new(SeededRandom::new(seed)),
        None => Arc::new(ThreadRandom),
    };
    Ok(PipelineCompiler::new(options, random)?)
}

/// Accept inline JSON or `@path`. A lone stage object is treated as a
/// one-stage pipeline.
fn read_pipeline(arg: &str) -> CliResult<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    Ok(match serde_json::from_str(&text)? {
        Value::Object(stage) => Value::Array(vec![Value::Object(stage)]),
        other => other,
    })
}

fn compile(compiler: &PipelineCompiler, collection: &str, pipeline: &str) -> CliResult<String> {
    let raw = read_pipeline(pipeline)?;
    let pipeline = StageValidator::new()?.pipeline(&raw)?;
    let query = compiler.compile(collection, &pipeline)?;
    Ok(display::format_query(&query))
}

async fn run(
    compiler: PipelineCompiler,
    collection: &str,
    pipeline: &str,
    data: Option<&PathBuf>,
    raw_json: bool,
) -> CliResult<String> {
    let raw = read_pipeline(pipeline)?;
    let db = MemoryDatabase::new();
    db.create_collection(collection)?;
    if let Some(path) = data {
        load_seed(&db, path)?;
    }

    let repo = Repository::with_compiler(db, compiler)?;
    let rows = repo.aggregate(collection, &raw).await?.await?;
    Ok(display::format_rows(&rows, raw_json))
}

fn load_seed(db: &MemoryDatabase, path: &PathBuf) -> CliResult<()> {
    let seed: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    let Value::Object(collections) = seed else {
        return Err("seed file must be an object of collection -> documents".into());
    };
    for (name, docs) in collections {
        let Value::Array(docs) = docs else {
            return Err(format!("seed collection '{name}' must be an array").into());
        };
        db.load(&name, docs)?;
    }
    Ok(())
}
