mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gavel-cli")]
#[command(about = "Gavel CLI - Run and judge code in the sandbox, manage the language table", long_about = None)]
struct Cli {
    /// Language table to use instead of GAVEL_LANGUAGES_FILE / the built-in table
    #[arg(long, global = true)]
    languages_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file once against an input
    Run {
        /// Language identifier (e.g., python, cpp, java)
        #[arg(short, long)]
        language: String,

        /// Source file to execute
        #[arg(short, long)]
        file: PathBuf,

        /// File whose contents are fed to stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Time limit in milliseconds (defaults to the language profile)
        #[arg(short, long)]
        time_limit_ms: Option<u64>,
    },

    /// Judge a source file against a JSON array of test cases
    Judge {
        /// Language identifier (e.g., python, cpp, java)
        #[arg(short, long)]
        language: String,

        /// Source file to judge
        #[arg(short, long)]
        file: PathBuf,

        /// JSON file: [{"input": "...", "expected_output": "..."}, ...]
        #[arg(short, long)]
        cases: PathBuf,

        /// Problem time limit in milliseconds
        #[arg(long, default_value = "2000")]
        time_limit_ms: u64,

        /// Problem memory limit in MB
        #[arg(long, default_value = "256")]
        memory_limit_mb: u64,

        /// Keep going after the first failing case
        #[arg(long, default_value = "false")]
        run_all: bool,
    },

    /// List configured languages
    Languages,

    /// Write the built-in language table to a JSON file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "config/languages.json")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Pull every image referenced by the language table
    PullImages,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let languages_file = cli.languages_file.as_deref();

    match cli.command {
        Commands::Run {
            language,
            file,
            input,
            time_limit_ms,
        } => {
            commands::run_file(languages_file, &language, &file, input.as_deref(), time_limit_ms).await?;
        }
        Commands::Judge {
            language,
            file,
            cases,
            time_limit_ms,
            memory_limit_mb,
            run_all,
        } => {
            commands::judge_file(
                languages_file,
                &language,
                &file,
                &cases,
                time_limit_ms,
                memory_limit_mb,
                run_all,
            )
            .await?;
        }
        Commands::Languages => {
            commands::list_languages(languages_file)?;
        }
        Commands::InitConfig { path, force } => {
            commands::init_config(&path, force)?;
        }
        Commands::PullImages => {
            commands::pull_images(languages_file).await?;
        }
    }

    Ok(())
}
