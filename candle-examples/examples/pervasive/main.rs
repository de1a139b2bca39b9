//! HMM read/write controller on a synthetic copy task.
//!
//! A tiny attention model learns to copy its source while an HMM controller
//! learns when to read and when to write from the model's own attention. Each
//! step simulates several data-parallel workers and reduces their logging
//! statistics the same way a distributed trainer would.
//!
//! ```bash
//! cargo run --example pervasive --release -- --cpu --steps 100
//!
//! # Stronger alignment supervision and a deeper gate
//! cargo run --example pervasive --release -- --cpu \
//!     --regul-align-scale 0.5 --num-controller-layers 2
//!
//! # Configuration from a JSON file, statistics as JSON lines
//! cargo run --example pervasive --release -- \
//!     --config candle-examples/examples/pervasive/pervasive.json --json
//! ```

use std::path::PathBuf;

use anyhow::Result;
use candle::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, linear, AdamW, Embedding, Linear, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};

use candle_pervasive::criterions::{
    aggregate_logging_outputs, AlignLabelSmoothedCrossEntropy, NetOutput, Sample, Seq2SeqModel,
};
use candle_pervasive::models::hmm_controls::HmmControls;
use candle_pervasive::{Config, ControlsConfig, CriterionConfig};

const BOS: u32 = 0;
const PAD: u32 = 1;
/// First id that can appear as a real token.
const FIRST_TOKEN: u32 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train an HMM read/write controller on a synthetic copy task")]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// JSON configuration with `controls` and `criterion` sections.
    /// Overrides the controller and criterion flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print aggregated statistics as JSON lines.
    #[arg(long)]
    json: bool,

    /// Number of optimisation steps.
    #[arg(long, default_value_t = 50)]
    steps: usize,

    /// Simulated data-parallel workers per step.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Sentences per worker batch.
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Source (and target) length.
    #[arg(long, default_value_t = 6)]
    seq_len: usize,

    /// Vocabulary size, including BOS and padding.
    #[arg(long, default_value_t = 16)]
    vocab_size: usize,

    /// Model width. The controller sees `2 * hidden_size` features per cell.
    #[arg(long, default_value_t = 16)]
    hidden_size: usize,

    #[arg(long, default_value_t = 1e-2)]
    learning_rate: f64,

    #[arg(long, default_value_t = 0.1)]
    label_smoothing: f64,

    #[arg(long, default_value_t = 0.1)]
    regul_align_scale: f64,

    #[arg(long, default_value_t = 1)]
    num_controller_layers: usize,

    /// Keep the controller from back-propagating into the model.
    #[arg(long)]
    detach_controls: bool,

    /// Normalise the loss per sentence instead of per token.
    #[arg(long)]
    sentence_avg: bool,

    /// The seed to use when generating batches.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,
}

impl Args {
    fn config(&self) -> Result<Config> {
        let config = match &self.config {
            Some(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
            None => Config {
                controls: ControlsConfig {
                    controller_dim: 2 * self.hidden_size,
                    num_controller_layers: self.num_controller_layers,
                    detach_controls: self.detach_controls,
                },
                criterion: CriterionConfig {
                    label_smoothing: self.label_smoothing,
                    regul_align_scale: self.regul_align_scale,
                    sentence_avg: self.sentence_avg,
                    padding_idx: PAD,
                },
            },
        };
        config.validate()?;
        if config.controls.controller_dim != 2 * self.hidden_size {
            anyhow::bail!(
                "controller_dim {} must be twice the hidden size {}",
                config.controls.controller_dim,
                self.hidden_size
            )
        }
        if config.criterion.padding_idx != PAD {
            anyhow::bail!("the copy task pads with id {PAD}, got {}", config.criterion.padding_idx)
        }
        Ok(config)
    }
}

struct NetInput {
    /// `(B, Ts)`
    src_tokens: Tensor,
    /// `(B, Tt)` targets shifted right behind BOS.
    prev_output_tokens: Tensor,
}

/// Single-head dot-product attention over embedded source tokens.
struct CopyModel {
    src_embed: Embedding,
    tgt_embed: Embedding,
    positions: Embedding,
    output: Linear,
    hidden_size: usize,
}

impl CopyModel {
    fn new(vocab_size: usize, max_len: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            src_embed: embedding(vocab_size, hidden_size, vb.pp("src_embed"))?,
            tgt_embed: embedding(vocab_size, hidden_size, vb.pp("tgt_embed"))?,
            positions: embedding(max_len, hidden_size, vb.pp("positions"))?,
            output: linear(2 * hidden_size, vocab_size, vb.pp("output"))?,
            hidden_size,
        })
    }

    fn embed(&self, table: &Embedding, tokens: &Tensor) -> candle::Result<Tensor> {
        let len = tokens.dim(1)?;
        let positions = Tensor::arange(0u32, len as u32, tokens.device())?;
        table
            .forward(tokens)?
            .broadcast_add(&self.positions.forward(&positions)?)
    }

    /// `(keys (B, Ts, H), queries (B, Tt, H))`
    fn encode(&self, input: &NetInput) -> candle::Result<(Tensor, Tensor)> {
        let keys = self.embed(&self.src_embed, &input.src_tokens)?;
        let queries = self.embed(&self.tgt_embed, &input.prev_output_tokens)?;
        Ok((keys, queries))
    }

    /// Per-cell controller features `(B, Tt, Ts, 2H)`: the query of the target
    /// step next to the key of the source position.
    fn controller_features(&self, input: &NetInput) -> candle::Result<Tensor> {
        let (keys, queries) = self.encode(input)?;
        let (b_size, src_len, hidden) = keys.dims3()?;
        let tgt_len = queries.dim(1)?;
        let shape = (b_size, tgt_len, src_len, hidden);
        let queries = queries.unsqueeze(2)?.broadcast_as(shape)?;
        let keys = keys.unsqueeze(1)?.broadcast_as(shape)?;
        Tensor::cat(&[&queries, &keys], D::Minus1)
    }
}

impl Seq2SeqModel for CopyModel {
    type Input = NetInput;

    fn forward(&self, input: &NetInput) -> candle::Result<NetOutput> {
        let (keys, queries) = self.encode(input)?;
        let scores = (queries.matmul(&keys.t()?)? / (self.hidden_size as f64).sqrt())?;
        let attention = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let context = attention.matmul(&keys)?;
        let logits = self
            .output
            .forward(&Tensor::cat(&[&queries, &context], D::Minus1)?)?;
        Ok(NetOutput { logits, attention })
    }

    fn get_normalized_probs(&self, net_output: &NetOutput, log_probs: bool) -> candle::Result<Tensor> {
        if log_probs {
            candle_nn::ops::log_softmax(&net_output.logits, D::Minus1)
        } else {
            candle_nn::ops::softmax(&net_output.logits, D::Minus1)
        }
    }
}

/// Copy task: the target repeats the source, so target step `t` aligns with
/// source position `t + 1` (1-indexed). Sentence tails are padded at random.
fn copy_batch(rng: &mut StdRng, args: &Args, device: &Device) -> Result<Sample<NetInput>> {
    let (b_size, len) = (args.batch_size, args.seq_len);
    let mut src = Vec::with_capacity(b_size * len);
    let mut target = Vec::with_capacity(b_size * len);
    let mut contexts = Vec::with_capacity(b_size * len);
    let mut ntokens = 0;
    for _ in 0..b_size {
        let n_pad = rng.gen_range(0..=len / 2);
        for t in 0..len {
            let token = rng.gen_range(FIRST_TOKEN..args.vocab_size as u32);
            let padded = t >= len - n_pad;
            src.push(token);
            target.push(if padded { PAD } else { token });
            contexts.push(if padded { 0 } else { t as u32 + 1 });
            if !padded {
                ntokens += 1;
            }
        }
    }
    let prev: Vec<u32> = target
        .chunks(len)
        .flat_map(|tgt| std::iter::once(BOS).chain(tgt[..len - 1].iter().copied()))
        .collect();
    Ok(Sample {
        net_input: NetInput {
            src_tokens: Tensor::from_vec(src, (b_size, len), device)?,
            prev_output_tokens: Tensor::from_vec(prev, (b_size, len), device)?,
        },
        target: Tensor::from_vec(target, (b_size, len), device)?,
        ntokens,
        contexts: Tensor::from_vec(contexts, (b_size, len), device)?,
    })
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = candle_examples::setup_tracing(args.tracing);
    let device = candle_examples::device(args.cpu)?;
    let config = args.config()?;
    if args.seq_len < 2 || args.vocab_size <= FIRST_TOKEN as usize {
        anyhow::bail!("need --seq-len >= 2 and --vocab-size > {FIRST_TOKEN}")
    }
    tracing::info!(?config, ?device, "starting");

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = CopyModel::new(args.vocab_size, args.seq_len, args.hidden_size, vb.pp("model"))?;
    let controller = HmmControls::new(&config.controls, vb.pp("controller"))?;
    let criterion = AlignLabelSmoothedCrossEntropy::new(&config.criterion)?;
    let params = ParamsAdamW {
        lr: args.learning_rate,
        ..Default::default()
    };
    let mut opt = AdamW::new(varmap.all_vars(), params)?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    for step in 0..args.steps {
        let mut total_loss = Tensor::zeros((), DType::F32, &device)?;
        let mut sample_size = 0;
        let mut logging_outputs = Vec::with_capacity(args.workers);
        let mut controls_loss = 0f64;
        for _worker in 0..args.workers {
            let sample = copy_batch(&mut rng, &args, &device)?;
            let (loss, worker_size, logs) = criterion.forward(&model, &sample)?;

            // The model's attention doubles as the controller's emission scores.
            let attention = model.forward(&sample.net_input)?.attention;
            let emissions = attention.affine(1., 1e-5)?.log()?.transpose(0, 1)?;
            let observations = model.controller_features(&sample.net_input)?;
            let controls = controller.forward(&observations, &emissions)?;
            let worker_controls_loss = controls.controls_loss()?;
            controls_loss += worker_controls_loss.to_scalar::<f32>()? as f64;

            total_loss = (total_loss + loss)?.add(&worker_controls_loss)?;
            sample_size += worker_size;
            logging_outputs.push(logs);
        }
        let total_loss = (total_loss / sample_size.max(1) as f64)?;
        opt.backward_step(&total_loss)?;

        let logs = aggregate_logging_outputs(&logging_outputs);
        if args.json {
            println!("{}", serde_json::to_string(&logs)?);
        } else {
            println!(
                "step {step:4} | loss {:.3} | nll {:.3} | regul {:.3} | controls {:.3} | ntokens {}",
                logs.loss,
                logs.nll_loss,
                logs.regul_loss,
                controls_loss / logs.ntokens.max(1) as f64,
                logs.ntokens,
            );
        }
    }

    // Most likely source position per target step for one fresh sentence.
    let sample = copy_batch(&mut rng, &args, &device)?;
    let attention = model.forward(&sample.net_input)?.attention;
    let emissions = attention.affine(1., 1e-5)?.log()?.transpose(0, 1)?;
    let observations = model.controller_features(&sample.net_input)?;
    let controls = controller.forward(&observations, &emissions)?;
    let positions: Vec<u32> = controls.gamma.i((.., 0))?.argmax(D::Minus1)?.to_vec1()?;
    let gold: Vec<u32> = sample.contexts.i(0)?.to_vec1()?;
    println!("posterior alignment: {:?}", positions.iter().map(|p| p + 1).collect::<Vec<_>>());
    println!("reference alignment: {gold:?}");
    Ok(())
}
