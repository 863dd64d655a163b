use std::io::Read;
use std::path::PathBuf;

use clap::Parser;
use onllm::model::DEFAULT_MODEL;
use onllm::Platform;
use onllm_cli::{
    chat_loop, check_dir, list_models, load_config, load_document, load_registry, open_embedder,
    open_session, render_prompt, GenerationOverrides, Result,
};
use tracing_subscriber::EnvFilter;

/// onllm: on-device chat generation
#[derive(Parser)]
#[command(name = "onllm", version)]
struct Cli {
    /// Settings file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Chat with a downloaded model over stdin/stdout.
    Chat {
        /// Registry name of the model.
        #[arg(short, long, default_value = DEFAULT_MODEL)]
        model: String,

        /// Directory holding one subdirectory per model.
        #[arg(long)]
        models_dir: Option<PathBuf>,

        /// Answer only from this text document. Uses the all-MiniLM-L6-V2
        /// embedding model when it is in the models directory.
        #[arg(short, long)]
        document: Option<PathBuf>,

        /// Argmax decoding.
        #[arg(long)]
        greedy: bool,

        /// Maximum number of tokens to generate (32..=1024).
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature (0.0..=1.5).
        #[arg(short, long)]
        temperature: Option<f32>,

        /// Keep the k most likely tokens (1..=100).
        #[arg(long)]
        top_k: Option<usize>,

        /// Nucleus threshold (0.1..=1.0).
        #[arg(long)]
        top_p: Option<f32>,

        /// Random seed for reproducible sampling.
        #[arg(short, long)]
        seed: Option<u64>,
    },

    /// Print the prompt a model sees for a JSON message list.
    Render {
        /// JSON file with `[{"role": ..., "content": ...}]`; `-` reads stdin.
        messages: PathBuf,

        #[arg(short, long, default_value = DEFAULT_MODEL)]
        model: String,

        /// Leave out the trailing assistant header.
        #[arg(long)]
        no_generation_prompt: bool,
    },

    /// List known models.
    Models {
        /// Only models that run on phones.
        #[arg(long)]
        android: bool,
    },

    /// Report missing files in a model directory.
    Check { dir: PathBuf },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Chat {
            model,
            models_dir,
            document,
            greedy,
            max_tokens,
            temperature,
            top_k,
            top_p,
            seed,
        } => {
            let registry = load_registry(&config, Platform::current())?;
            let mut session = open_session(&config, &registry, &model, models_dir.as_deref())?;
            let overrides = GenerationOverrides {
                greedy,
                max_tokens,
                temperature,
                top_k,
                top_p,
                seed,
            };
            session.set_generation_config(overrides.apply(config.generation.clone()));
            if let Some(path) = document {
                let embedder = open_embedder(&config, models_dir.as_deref())?;
                session.attach_documents(load_document(&path, embedder)?);
            }

            let stdin = std::io::stdin();
            let mut stdout = std::io::stdout();
            chat_loop(&mut session, stdin.lock(), &mut stdout)
        }

        Command::Render {
            messages,
            model,
            no_generation_prompt,
        } => {
            let json = if messages.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&messages)?
            };
            let registry = load_registry(&config, Platform::current())?;
            print!("{}", render_prompt(&registry, &model, &json, !no_generation_prompt)?);
            Ok(())
        }

        Command::Models { android } => {
            let platform = if android {
                Platform::Android
            } else {
                Platform::current()
            };
            print!("{}", list_models(&load_registry(&config, platform)?));
            Ok(())
        }

        Command::Check { dir } => {
            check_dir(&dir)?;
            println!("{}: ok", dir.display());
            Ok(())
        }
    }
}
