mod commands;

use anyhow::Result;
use assay_common::config::SandboxBackendKind;
use assay_engine::registry::CommentStyle;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "assay-cli")]
#[command(about = "Assay CLI - Run submissions locally and manage language configurations", long_about = None)]
struct Cli {
    /// Path to languages.json
    #[arg(long, global = true, default_value = "config/languages.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Process,
    Docker,
}

impl From<Backend> for SandboxBackendKind {
    fn from(value: Backend) -> Self {
        match value {
            Backend::Process => SandboxBackendKind::Process,
            Backend::Docker => SandboxBackendKind::Docker,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Comments {
    C,
    Hash,
    Script,
}

impl From<Comments> for CommentStyle {
    fn from(value: Comments) -> Self {
        match value {
            Comments::C => CommentStyle::C,
            Comments::Hash => CommentStyle::Hash,
            Comments::Script => CommentStyle::Script,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a request file and print the response JSON
    Run {
        /// Request JSON (same schema as POST /execute)
        #[arg(short, long)]
        file: PathBuf,

        /// Sandbox backend; `process` gives no isolation from the host
        #[arg(short, long, value_enum, default_value = "docker")]
        backend: Backend,
    },

    /// List configured languages
    Languages,

    /// Add a new programming language to config/languages.json
    AddLang {
        /// Language identifier (e.g., go, kotlin)
        #[arg(short, long)]
        name: String,

        /// File extension (e.g., go, kt)
        #[arg(short, long)]
        ext: String,

        /// Language version (e.g., 1.22)
        #[arg(short, long, default_value = "latest")]
        version: String,

        /// Docker image used by the docker backend
        #[arg(short, long)]
        image: String,

        /// Run command template; `{source}` is the source file name
        #[arg(short, long)]
        run: String,

        /// Compile command template, for compiled languages
        #[arg(short, long)]
        compile: Option<String>,

        /// Source file name (defaults to main.<ext>)
        #[arg(long)]
        source_file: Option<String>,

        /// Default timeout in milliseconds
        #[arg(short, long, default_value = "10000")]
        timeout_ms: u64,

        /// Memory limit in MB
        #[arg(short, long, default_value = "256")]
        memory: u32,

        /// CPU limit
        #[arg(long, default_value = "1.0")]
        cpu: f32,

        /// Comment syntax, used by the plagiarism tokenizer
        #[arg(long, value_enum, default_value = "c")]
        comments: Comments,
    },

    /// Write a default config/languages.json
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing languages.json
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Print the similarity of two source files
    Compare {
        /// Language of both files
        #[arg(short, long)]
        language: String,

        first: PathBuf,
        second: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, backend } => {
            commands::run_request(&cli.config, &file, backend.into()).await?;
        }
        Commands::Languages => {
            commands::list_languages(&cli.config)?;
        }
        Commands::AddLang {
            name,
            ext,
            version,
            image,
            run,
            compile,
            source_file,
            timeout_ms,
            memory,
            cpu,
            comments,
        } => {
            let spec = commands::NewLanguage {
                name,
                ext,
                version,
                image,
                run,
                compile,
                source_file,
                timeout_ms,
                memory_limit_mb: memory,
                cpu_limit: cpu,
                comment_style: comments.into(),
            };
            commands::add_language(&cli.config, spec)?;
        }
        Commands::Init { path, force } => {
            commands::init_project(&path, force)?;
        }
        Commands::Compare {
            language,
            first,
            second,
        } => {
            commands::compare(&cli.config, &language, &first, &second)?;
        }
    }

    Ok(())
}
