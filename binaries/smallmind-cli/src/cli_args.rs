use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use smallmind_core::config::{EngineOptions, SamplingOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate text from a prompt against a loaded model.
    Generate(Generate),
    /// Convert a GGUF model into the native SMQ container.
    ImportGguf(ImportGguf),
    /// Verify an SMQ model's SHA-256 integrity against its manifest.
    Verify(Verify),
    /// Print an SMQ model's manifest.
    Inspect(Inspect),
}

#[derive(Parser, Debug)]
pub struct Generate {
    /// Path to a `.gguf` or `.smq` model file.
    pub model: PathBuf,

    /// The prompt to generate from.
    pub prompt: String,

    /// Maximum number of tokens to generate after the prompt.
    #[arg(long, default_value_t = 256)]
    pub max_tokens: usize,

    /// Softmax temperature; `0` selects greedy decoding.
    #[arg(long, default_value_t = 0.8)]
    pub temperature: f32,

    /// Nucleus sampling threshold.
    #[arg(long, default_value_t = 0.95)]
    pub top_p: f32,

    /// Retain only the `top_k` highest-probability tokens; `0` disables.
    #[arg(long, default_value_t = 40)]
    pub top_k: usize,

    /// RNG seed; omit for per-session entropy.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Allow loading a GGUF file directly instead of requiring SMQ.
    #[arg(long, default_value_t = true)]
    pub allow_gguf: bool,

    /// Wall-clock budget for the call, in seconds.
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    /// Worker thread count for the engine's pool. `0` auto-detects via
    /// `SMALLMIND_NUM_THREADS` or the platform's available parallelism.
    #[arg(long, default_value_t = 0)]
    pub threads: usize,
}

impl Generate {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            model_path: self.model.clone(),
            max_context_tokens: 0,
            enable_kv_cache: true,
            allow_gguf_import: self.allow_gguf,
            request_timeout: Duration::from_secs(self.timeout_secs),
            num_threads: self.threads,
            quant_dequant_block_size_override: None,
        }
    }

    pub fn sampling_options(&self) -> SamplingOptions {
        SamplingOptions {
            max_new_tokens: self.max_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
            ..SamplingOptions::default()
        }
    }
}

#[derive(Parser, Debug)]
pub struct ImportGguf {
    /// Source GGUF file.
    pub input: PathBuf,
    /// Destination SMQ file.
    pub output: PathBuf,
}

#[derive(Parser, Debug)]
pub struct Verify {
    /// SMQ model file to check.
    pub model: PathBuf,
}

#[derive(Parser, Debug)]
pub struct Inspect {
    /// SMQ model file to print.
    pub model: PathBuf,
}
