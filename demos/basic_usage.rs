use std::collections::HashSet;
use std::sync::Arc;
use towerrec::services::dataset::{leave_last_out, synthetic};
use towerrec::services::training::TrainingObserver;
use towerrec::*;

struct EpochPrinter;

impl TrainingObserver for EpochPrinter {
    fn on_epoch_end(&mut self, report: &EpochReport) {
        println!("   epoch {:>2}  loss {:.4}", report.epoch, report.mean_loss);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    println!("🚀 TowerRec basic usage");

    // 1. Dataset
    let dataset = synthetic::random(100, 300, 15, 19, 42)?;
    let split = leave_last_out(&dataset);
    println!(
        "📦 {} users, {} items, {} training interactions, {} held out",
        split.train.num_users(),
        split.train.num_items(),
        split.train.interactions.len(),
        split.test.len()
    );

    // 2. Baseline lookup towers with in-batch softmax
    let mut config = Config::default();
    config.training.epochs = 5;
    config.training.batch_size = 128;
    config.training.seed = Some(42);

    let service = RecommendationService::new(config.clone(), Arc::new(split.train))?;
    println!("🏋️ training baseline model");
    let report = service.train_with_observer(&config, &mut EpochPrinter).await?;
    println!("✅ run {} finished, final loss {:?}", report.run_id, report.final_loss());

    // 3. Recommendations
    let user = 0;
    let recommendations = service.recommend_unrated(user, 5).await?;
    println!("🎯 top 5 for user {}:", user);
    for rec in &recommendations {
        println!("   item {:>4}  score {:.4}", rec.item, rec.score);
    }

    let exclude: HashSet<usize> = recommendations.iter().map(|r| r.item).collect();
    let next = service.recommend(user, &exclude, 3).await?;
    let next_items: Vec<usize> = next.iter().map(|r| r.item).collect();
    println!("➡️  next 3 after excluding those: {:?}", next_items);

    // 4. Holdout metrics
    let metrics = service.evaluate(&split.test, 10).await?;
    println!("📊 {}", serde_json::to_string_pretty(&metrics)?);

    // 5. Deep towers with BPR
    config.model.use_deep_tower = true;
    config.training.loss = LossType::Bpr;
    println!("🏋️ training deep model with BPR");
    let report = service.train_with_observer(&config, &mut EpochPrinter).await?;
    println!("✅ loss history {:?}", report.loss_history());

    let metrics = service.evaluate(&split.test, 10).await?;
    println!("📊 hit rate@10 {:.3}, ndcg@10 {:.3}", metrics.hit_rate_at_k, metrics.ndcg_at_k);

    Ok(())
}
