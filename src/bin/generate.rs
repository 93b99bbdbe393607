//! strata-generate: Generate token ids from a Qwen2 safetensors checkpoint.

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;

use strata_qwen2::backend::DeviceType;
use strata_qwen2::cli;
use strata_qwen2::engine::generate::GenerationConfig;
use strata_qwen2::engine::sampler::SamplingConfig;
use strata_qwen2::model::config::{LoadOptions, DEFAULT_MAX_SEQ_CEILING};

#[derive(Parser)]
#[command(
    name = "strata-generate",
    about = "Generate token ids from a Qwen2 checkpoint directory"
)]
struct Args {
    /// Checkpoint directory containing config.json and *.safetensors
    #[arg(short = 'm', long)]
    model: PathBuf,

    /// Input token ids, comma or space separated
    #[arg(long, conflicts_with_all = ["file", "stdin"])]
    token_ids: Option<String>,

    /// Read input token ids from a file
    #[arg(short = 'f', long, conflicts_with = "stdin")]
    file: Option<PathBuf>,

    /// Read input token ids from stdin
    #[arg(long)]
    stdin: bool,

    /// Maximum tokens to generate
    #[arg(short = 'n', long, default_value = "128")]
    max_tokens: usize,

    /// Temperature (0.0 = greedy)
    #[arg(long, default_value = "0.8")]
    temp: f32,

    /// Top-k sampling (1 = greedy, 0 = disabled)
    #[arg(long, default_value = "1")]
    top_k: usize,

    /// Top-p (nucleus) sampling
    #[arg(long, default_value = "0.8")]
    top_p: f32,

    /// Random seed for sampling
    #[arg(short = 's', long)]
    seed: Option<u64>,

    /// Device: cpu or nvidia
    #[arg(long, default_value = "cpu")]
    device: DeviceType,

    /// Device ordinal; repeat for multiple devices
    #[arg(long = "device-id", default_value = "0")]
    device_ids: Vec<i32>,

    /// Engine: auto, reference, llaisys
    #[arg(long, default_value = "auto")]
    engine: String,

    /// Path to the native llaisys library
    #[arg(long)]
    library: Option<PathBuf>,

    /// Ceiling applied to max_position_embeddings
    #[arg(long, default_value_t = DEFAULT_MAX_SEQ_CEILING)]
    max_seq_ceiling: usize,

    /// Don't echo the input ids in text output
    #[arg(long)]
    no_display_prompt: bool,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = validate_output_format)]
    output_format: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!(
            "Unknown output format '{}'. Options: text, json",
            s
        )),
    }
}

#[derive(Serialize)]
struct Timings {
    load_ms: f64,
    prefill_ms: f64,
    decode_ms: f64,
    total_ms: f64,
    decode_tok_per_sec: f64,
}

#[derive(Serialize)]
struct ConfigOutput {
    max_tokens: usize,
    temperature: f32,
    top_k: usize,
    top_p: f32,
    seed: Option<u64>,
}

#[derive(Serialize)]
struct JsonOutput {
    model: String,
    engine: String,
    device: String,
    input: Vec<i64>,
    output: Vec<i64>,
    tokens: Vec<i64>,
    generated_tokens: usize,
    stop_reason: String,
    timings: Timings,
    config: ConfigOutput,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let inputs = cli::read_token_ids(args.token_ids.as_deref(), args.file.as_deref(), args.stdin)?;

    let total_start = Instant::now();

    let options = LoadOptions {
        max_seq_ceiling: args.max_seq_ceiling,
        ..Default::default()
    };

    let load_start = Instant::now();
    let mut model = cli::backend::open_model(
        Some(&args.engine),
        args.library.as_deref(),
        &args.model,
        args.device,
        &args.device_ids,
        &options,
    )?;
    let load_ms = load_start.elapsed().as_secs_f64() * 1000.0;

    let gen_config = GenerationConfig {
        max_new_tokens: args.max_tokens,
        stop_tokens: Vec::new(),
        sampling: SamplingConfig {
            temperature: args.temp,
            top_k: args.top_k,
            top_p: args.top_p,
            seed: args.seed,
        },
    };

    // The first callback fires once prefill has produced its token.
    let gen_start = Instant::now();
    let mut first_token_at: Option<Instant> = None;
    let output = model.generate_stream(&inputs, &gen_config, |_token| {
        if first_token_at.is_none() {
            first_token_at = Some(Instant::now());
        }
        true
    })?;
    let gen_end = Instant::now();

    let prefill_end = first_token_at.unwrap_or(gen_end);
    let prefill_ms = (prefill_end - gen_start).as_secs_f64() * 1000.0;
    let decode_ms = (gen_end - prefill_end).as_secs_f64() * 1000.0;
    let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;

    let generated = output.generated().to_vec();
    let decode_steps = generated.len().saturating_sub(1);
    let decode_tok_per_sec = if decode_ms > 0.0 {
        decode_steps as f64 / (decode_ms / 1000.0)
    } else {
        0.0
    };

    match args.output_format.as_str() {
        "json" => {
            let json = JsonOutput {
                model: args.model.display().to_string(),
                engine: model.engine_name().to_string(),
                device: args.device.to_string(),
                input: inputs,
                generated_tokens: generated.len(),
                output: generated,
                tokens: output.tokens.clone(),
                stop_reason: output.stop_reason.to_string(),
                timings: Timings {
                    load_ms,
                    prefill_ms,
                    decode_ms,
                    total_ms,
                    decode_tok_per_sec,
                },
                config: ConfigOutput {
                    max_tokens: args.max_tokens,
                    temperature: args.temp,
                    top_k: args.top_k,
                    top_p: args.top_p,
                    seed: args.seed,
                },
            };
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        _ => {
            let shown = if args.no_display_prompt {
                &generated[..]
            } else {
                &output.tokens[..]
            };
            let line: Vec<String> = shown.iter().map(|t| t.to_string()).collect();
            println!("{}", line.join(" "));
        }
    }

    Ok(())
}
