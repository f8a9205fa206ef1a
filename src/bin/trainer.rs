use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use towerrec::services::dataset::{leave_last_out, load_movielens, synthetic};
use towerrec::{init_tracing, Config, Interaction, RecommendationService};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// MovieLens-100K directory containing u.data, u.item and u.genre.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// User index to print recommendations for.
    #[arg(short, long, default_value_t = 0)]
    user: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing();

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };
    if args.data_dir.is_some() {
        config.data.movielens_dir = args.data_dir.clone();
    }
    info!("Training configuration loaded: {:?}", config.training);

    let dataset = match &config.data.movielens_dir {
        Some(dir) => load_movielens(dir)
            .with_context(|| format!("loading MovieLens from {}", dir.display()))?,
        None => {
            info!("No dataset directory given, generating a synthetic dataset");
            synthetic::random(200, 500, 20, 19, config.training.seed.unwrap_or(42))?
        }
    };

    let (train, held_out): (_, Vec<Interaction>) = if config.data.holdout_last {
        let split = leave_last_out(&dataset);
        (split.train, split.test)
    } else {
        (dataset, Vec::new())
    };

    let service = RecommendationService::new(config.clone(), Arc::new(train))?;

    let canceller = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && canceller.cancel().await {
            info!("Cancellation requested");
        }
    });

    let report = service.train().await?;
    println!("{}", serde_json::to_string_pretty(&report.loss_history())?);

    let recommendations = service.recommend_unrated(args.user, config.retrieval.top_k).await?;
    for rec in &recommendations {
        let title = service
            .dataset()
            .items
            .get(rec.item)
            .map(|item| item.title.as_str())
            .unwrap_or("?");
        println!("{:>6} {:.4} {}", rec.item, rec.score, title);
    }

    if !held_out.is_empty() {
        let metrics = service.evaluate(&held_out, config.retrieval.top_k).await?;
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    }

    Ok(())
}
