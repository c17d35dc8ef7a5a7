//! strata-static-generate: run the static LLM pipeline on a token-id prompt.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::process;

use clap::Parser;
use serde::Serialize;

use strata_static_llm::backend;
use strata_static_llm::cli;
use strata_static_llm::engine::sampler::{SamplingConfig, TokenId};
use strata_static_llm::engine::{
    EncodedInputs, GenerationConfig, GenerationEngine, PerfMetrics, StreamingStatus,
    TokenCallbackStreamer,
};
use strata_static_llm::model::{build_decoder, DecoderConfig};
use strata_static_llm::ComputeGraph;

#[derive(Parser)]
#[command(
    name = "strata-static-generate",
    about = "Generate tokens with the static-shape LLM pipeline"
)]
struct Args {
    /// Prompt: comma- or space-separated token IDs
    #[arg(short = 't', long, conflicts_with = "file")]
    token_ids: Option<String>,

    /// Read prompt token IDs from file
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Serialized graph (JSON) to compile instead of the built-in decoder
    #[arg(short = 'g', long)]
    graph: Option<PathBuf>,

    /// Directory for the default exported blob
    #[arg(long, default_value = ".")]
    models_dir: PathBuf,

    /// Prompt capacity (MAX_PROMPT_LEN)
    #[arg(long)]
    max_prompt_len: Option<usize>,

    /// Guaranteed response room (MIN_RESPONSE_LEN)
    #[arg(long)]
    min_response_len: Option<usize>,

    /// Generate-phase hint: FAST_COMPILE or BEST_PERF
    #[arg(long)]
    generate_hint: Option<String>,

    /// Import the compiled model from this blob (or export to it with --export-blob)
    #[arg(long)]
    blob_path: Option<PathBuf>,

    /// Compile and export the blob
    #[arg(long)]
    export_blob: bool,

    /// Extra pipeline property, KEY=VALUE (repeatable)
    #[arg(short = 'P', long = "property", value_parser = cli::parse_property)]
    properties: Vec<(String, serde_json::Value)>,

    /// Maximum tokens to generate (default: until EOS or cache exhaustion)
    #[arg(short = 'n', long)]
    max_new_tokens: Option<usize>,

    /// End-of-sequence token ID
    #[arg(long)]
    eos_token_id: Option<TokenId>,

    /// Additional stop token ID (repeatable)
    #[arg(long = "stop-token-id")]
    stop_token_ids: Vec<TokenId>,

    /// Temperature (0.0 = greedy)
    #[arg(long, default_value = "0.0")]
    temp: f32,

    /// Top-k sampling (0 = disabled)
    #[arg(long, default_value = "0")]
    top_k: usize,

    /// Top-p (nucleus) sampling
    #[arg(long, default_value = "1.0")]
    top_p: f32,

    /// Random seed for sampling
    #[arg(short = 's', long)]
    seed: Option<u64>,

    /// Layers of the built-in decoder
    #[arg(long, default_value = "1")]
    layers: usize,

    /// Use a u4-compressed head in the built-in decoder
    #[arg(long)]
    u4_head: bool,

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
        _ => Err(format!("Unknown output format '{}'. Options: text, json", s)),
    }
}

#[derive(Serialize)]
struct JsonOutput {
    prompt_tokens: usize,
    tokens: Vec<TokenId>,
    score: f32,
    status: String,
    max_prompt_len: usize,
    kvcache_total: usize,
    metrics: PerfMetrics,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    let result = run(args);
    backend::shutdown();
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn properties(args: &Args) -> BTreeMap<String, serde_json::Value> {
    let mut props: BTreeMap<_, _> = args.properties.iter().cloned().collect();
    if let Some(n) = args.max_prompt_len {
        props.insert("MAX_PROMPT_LEN".to_string(), n.into());
    }
    if let Some(n) = args.min_response_len {
        props.insert("MIN_RESPONSE_LEN".to_string(), n.into());
    }
    if let Some(hint) = &args.generate_hint {
        props.insert("GENERATE_HINT".to_string(), hint.clone().into());
    }
    if let Some(path) = &args.blob_path {
        props.insert("BLOB_PATH".to_string(), path.to_string_lossy().into_owned().into());
    }
    if args.export_blob {
        props.insert("EXPORT_BLOB".to_string(), true.into());
    }
    props
}

fn load_graph(args: &Args) -> Result<ComputeGraph, Box<dyn std::error::Error>> {
    match &args.graph {
        Some(path) => {
            let mut graph: ComputeGraph = serde_json::from_reader(BufReader::new(File::open(path)?))?;
            graph.validate()?;
            Ok(graph)
        }
        None => Ok(build_decoder(&DecoderConfig {
            layers: args.layers,
            u4_head: args.u4_head,
            ..DecoderConfig::default()
        })?),
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let prompt = cli::read_token_ids(args.token_ids.as_deref(), args.file.as_deref(), true)?;
    let props = properties(&args);

    let importing = args.blob_path.is_some() && !args.export_blob;
    let graph = if importing { None } else { Some(load_graph(&args)?) };

    let sampling = SamplingConfig {
        temperature: args.temp,
        top_k: args.top_k,
        top_p: args.top_p,
        seed: args.seed,
    };
    let mut config = if args.temp > 0.0 {
        GenerationConfig::multinomial(sampling)
    } else {
        GenerationConfig {
            sampling,
            ..GenerationConfig::greedy()
        }
    };
    config.max_new_tokens = args.max_new_tokens;
    config.eos_token_id = args.eos_token_id;
    config.stop_token_ids = args.stop_token_ids.iter().copied().collect();

    let device = backend::engine();
    let mut engine =
        GenerationEngine::load(device.as_ref(), graph.as_ref(), &args.models_dir, &props, config)?;

    let text_output = args.output_format == "text";
    let stdout = std::io::stdout();
    let mut streamer = TokenCallbackStreamer::new(|token| {
        if text_output {
            let mut out = stdout.lock();
            // A closed stdout ends generation.
            if write!(out, "{} ", token).and_then(|_| out.flush()).is_err() {
                return StreamingStatus::Stop;
            }
        }
        StreamingStatus::Running
    });
    let results = engine.generate(&EncodedInputs::from_ids(&prompt), None, &mut streamer)?;

    let tokens = results.tokens.into_iter().next().unwrap_or_default();
    let score = results.scores.first().copied().unwrap_or_default();
    if text_output {
        println!();
        eprintln!(
            "[{} prompt tokens, {} generated, status {}, score {:.4}]",
            prompt.len(),
            tokens.len(),
            results.status,
            score
        );
    } else {
        let json = JsonOutput {
            prompt_tokens: prompt.len(),
            tokens,
            score,
            status: results.status.to_string(),
            max_prompt_len: engine.max_prompt_len(),
            kvcache_total: engine.kvcache_total(),
            metrics: results.metrics,
        };
        println!("{}", serde_json::to_string_pretty(&json)?);
    }
    Ok(())
}
