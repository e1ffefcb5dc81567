#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use lowrank::builder::{BiasCorrection, ModelBuilder};
use lowrank::config::TrainingConfig;
use lowrank::data::load_ratings;
use lowrank::factorize::StopReason;
use lowrank::model::{RankedItem, RecommendationModel, RowKey};
use lowrank::progress::{BuildStage, TrainingObserver};

#[derive(Parser)]
#[command(
    name = "lowrank",
    about = "Train and query matrix-factorization recommendation models",
    long_about = "Learns low-rank factors of a sparse ratings table by gradient descent, \
                 fills in the unrated cells, and ranks items for each entity."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a ratings table
    #[command(about = "Train a model from a TSV ratings table (outputs: model.toml)")]
    Train(TrainArgs),

    /// Rank every item for one entity
    #[command(about = "Print every item for one entity, highest estimated score first")]
    Rank(QueryArgs),

    /// Recommend items an entity has not rated yet
    #[command(about = "Print the items one entity has not rated, highest estimated score first")]
    Recommend {
        #[command(flatten)]
        query: QueryArgs,

        /// Only print the best N items
        #[arg(long, value_name = "N")]
        top: Option<usize>,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// Path to the tab-separated ratings table (empty or 0 cells mean "not rated")
    ratings: PathBuf,

    /// TOML file with training settings; flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of latent features
    #[arg(long, value_name = "N")]
    k: Option<usize>,

    /// Maximum number of gradient-descent steps
    #[arg(long, value_name = "N")]
    steps: Option<usize>,

    /// Learning rate
    #[arg(long)]
    alpha: Option<f64>,

    /// L2 regularization coefficient
    #[arg(long)]
    beta: Option<f64>,

    /// Stop early once the total squared error falls below this value
    #[arg(long)]
    max_error: Option<f64>,

    /// Seed for the random factor initialization
    #[arg(long)]
    seed: Option<u64>,

    /// Remove global, row and column bias before factorizing
    #[arg(long)]
    bias: bool,

    /// Factorize the raw ratings even if the config file sets `use_bias = true`
    #[arg(long, conflicts_with = "bias")]
    no_bias: bool,

    /// The table has no header row and no leading row-label column
    #[arg(long)]
    no_labels: bool,

    /// Where to write the trained model
    #[arg(long, default_value = "model.toml")]
    output: PathBuf,
}

#[derive(Args)]
struct QueryArgs {
    /// Path to a trained model file (.toml)
    #[arg(long)]
    model: PathBuf,

    #[command(flatten)]
    row: RowArgs,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct RowArgs {
    /// Entity to query, by row label
    #[arg(long, value_name = "LABEL")]
    row: Option<String>,

    /// Entity to query, by zero-based row index
    #[arg(long, value_name = "INDEX")]
    row_index: Option<usize>,
}

impl TrainArgs {
    /// The bias setting requested on the command line, if any.
    fn bias_override(&self) -> Option<bool> {
        match (self.bias, self.no_bias) {
            (true, _) => Some(true),
            (false, true) => Some(false),
            (false, false) => None,
        }
    }
}

impl RowArgs {
    fn key(&self) -> Result<RowKey, Box<dyn Error>> {
        match (&self.row, self.row_index) {
            (Some(label), None) => Ok(RowKey::by_label(label.as_str())),
            (None, Some(index)) => Ok(RowKey::by_index(index)),
            _ => Err("exactly one of --row or --row-index is required".into()),
        }
    }
}

/// Draws training progress on stderr when it is a terminal.
struct TrainingProgressBar {
    bar: ProgressBar,
}

impl TrainingProgressBar {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        Self::with_draw_target(draw_target)
    }

    fn with_draw_target(draw_target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(None, draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl TrainingObserver for TrainingProgressBar {
    fn on_stage(&mut self, stage: BuildStage) {
        self.bar.set_message(stage.to_string());
    }

    fn on_start(&mut self, max_steps: usize) {
        self.bar.set_length(max_steps as u64);
        self.bar.set_position(0);
    }

    fn on_step(&mut self, step: usize, total_error: f64) {
        self.bar.set_position(step as u64 + 1);
        if step % 50 == 0 {
            self.bar.set_message(format!("error {:.4e}", total_error));
        }
    }

    fn on_finish(&mut self, reason: StopReason, iterations: usize) {
        self.bar.finish_with_message(format!("{} after {} steps", reason, iterations));
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train(args) => train_command(&args),
        Commands::Rank(query) => rank_command(&query),
        Commands::Recommend { query, top } => recommend_command(&query, top),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn train_command(args: &TrainArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::default(),
    };
    let factorization = &mut config.factorization;
    if let Some(k) = args.k {
        factorization.k = k;
    }
    if let Some(steps) = args.steps {
        factorization.steps = steps;
    }
    if let Some(alpha) = args.alpha {
        factorization.alpha = alpha;
    }
    if let Some(beta) = args.beta {
        factorization.beta = beta;
    }
    if let Some(max_error) = args.max_error {
        factorization.max_error = max_error;
    }
    if args.seed.is_some() {
        factorization.seed = args.seed;
    }
    if let Some(use_bias) = args.bias_override() {
        config.use_bias = use_bias;
    }

    println!("Loading ratings from: {}", args.ratings.display());
    let table = load_ratings(&args.ratings, !args.no_labels)?;
    let (rows, cols) = table.ratings.dim();
    println!(
        "Loaded {} entities x {} items ({} ratings)",
        rows,
        cols,
        table.ratings.observed().count()
    );

    let correction = if config.use_bias {
        BiasCorrection::Computed
    } else {
        BiasCorrection::Disabled
    };

    println!("Training model...");
    let mut progress = TrainingProgressBar::new();
    let model = ModelBuilder::new(config.factorization)
        .bias(correction)
        .row_labels(table.row_labels)
        .col_labels(table.col_labels)
        .build_with_observer(table.ratings, &mut progress)?;

    if let Some(summary) = model.summary() {
        println!(
            "Finished after {} steps ({}), total squared error {:.6e}",
            summary.iterations, summary.stop_reason, summary.total_error
        );
    }

    model.save(&args.output)?;
    println!("Model saved to: {}", args.output.display());

    Ok(())
}

fn rank_command(query: &QueryArgs) -> Result<(), Box<dyn Error>> {
    let model = RecommendationModel::load(&query.model)?;
    let items = model.rank_all_items(query.row.key()?)?;
    print_items(&items);
    Ok(())
}

fn recommend_command(query: &QueryArgs, top: Option<usize>) -> Result<(), Box<dyn Error>> {
    let model = RecommendationModel::load(&query.model)?;
    let key = query.row.key()?;
    let items = match top {
        Some(count) => model.top_recommendations(key, count)?,
        None => model.recommendations(key)?,
    };
    if items.is_empty() {
        println!("Nothing to recommend: every item has been rated.");
    }
    print_items(&items);
    Ok(())
}

fn print_items(items: &[RankedItem]) {
    println!("item\tscore");
    for ranked in items {
        println!("{}\t{:.6}", ranked.item, ranked.score);
    }
}
