use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use smallmind_core::model::smq;

mod cli_args;

use cli_args::{Args, Command};

fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let result = match &args.command {
        Command::Generate(cmd) => generate(cmd),
        Command::ImportGguf(cmd) => import_gguf(cmd),
        Command::Verify(cmd) => verify(cmd),
        Command::Inspect(cmd) => inspect(cmd),
    };

    match result {
        Ok(()) => ExitCode::from(0),
        Err(CliError::Validation(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(1)
        }
        Err(CliError::Other(err)) => {
            eprintln!("error: {err:?}");
            ExitCode::from(2)
        }
    }
}

/// Distinguishes user-input mistakes (exit 1) from model/coherence failures
/// (exit 2), per the documented CLI exit-code contract.
enum CliError {
    Validation(String),
    Other(anyhow::Error),
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::Other(err)
    }
}

fn generate(cmd: &cli_args::Generate) -> Result<(), CliError> {
    let options = cmd.engine_options();
    let model = smallmind_core::load_model(&options).context("loading model")?;
    let mut session = smallmind_core::GenerationSession::new(Arc::new(model), &options, None)
        .context("creating session")?;

    let sampling = cmd.sampling_options();
    let stdout = std::io::stdout();
    let stats = session
        .generate_streaming(&cmd.prompt, &sampling, &|| false, |token| {
            print!("{}", token.token_text);
            let _ = stdout.lock().flush();
        })
        .context("generation failed")?;

    println!();
    log::info!(
        "{} prompt tokens, {} generated, stopped: {:?}",
        stats.prompt_tokens,
        stats.generated_tokens,
        stats.stop_reason
    );
    Ok(())
}

fn import_gguf(cmd: &cli_args::ImportGguf) -> Result<(), CliError> {
    let options = smallmind_core::config::EngineOptions {
        model_path: cmd.input.clone(),
        allow_gguf_import: true,
        ..smallmind_core::config::EngineOptions::default()
    };
    let model = smallmind_core::load_model(&options).context("loading source GGUF model")?;

    let (model_dims, tensors) = smq::tensors_from_weights(&model.weights);
    let model_name = cmd
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model")
        .to_string();
    let buf = smq::write(&model_name, &iso8601_utc_now(), model_dims, &tensors);

    std::fs::write(&cmd.output, &buf).with_context(|| format!("writing {}", cmd.output.display()))?;
    println!("wrote {} ({} tensors, {} bytes)", cmd.output.display(), tensors.len(), buf.len());
    Ok(())
}

/// Current UTC time as an ISO-8601 second-precision string, computed from
/// `SystemTime` alone (no `chrono`/`time` dependency for one manifest field).
fn iso8601_utc_now() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = (secs / 86_400) as i64;
    let time_of_day = secs % 86_400;
    let (hour, minute, second) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);

    // Howard Hinnant's civil_from_days, days since 1970-01-01.
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}

fn verify(cmd: &cli_args::Verify) -> Result<(), CliError> {
    let data = std::fs::read(&cmd.model).with_context(|| format!("reading {}", cmd.model.display()))?;
    let file = smq::parse(&data).context("parsing SMQ file")?;
    smq::verify_integrity(&file).context("integrity check failed")?;
    println!("ok: {} tensors verified", file.directory.len());
    Ok(())
}

fn inspect(cmd: &cli_args::Inspect) -> Result<(), CliError> {
    let data = std::fs::read(&cmd.model).with_context(|| format!("reading {}", cmd.model.display()))?;
    let file = smq::parse(&data).context("parsing SMQ file")?;
    let manifest = &file.manifest;
    println!("model_name: {}", manifest.model_name);
    println!("format_version: {}", manifest.format_version);
    println!("tensor_count: {}", manifest.tensor_count);
    println!("quant_schemes: {}", manifest.quant_schemes.join(", "));
    println!(
        "dims: layers={} hidden={} vocab={} context={} heads={} kv_heads={} head_dim={}",
        manifest.model_dims.num_layers,
        manifest.model_dims.hidden_dim,
        manifest.model_dims.vocab_size,
        manifest.model_dims.context_length,
        manifest.model_dims.num_heads,
        manifest.model_dims.num_kv_heads,
        manifest.model_dims.head_dim,
    );
    Ok(())
}
