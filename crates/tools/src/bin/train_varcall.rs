//! バリアントコール分類器の学習ドライバ
//!
//! データセット blob を読み込み、参照モデルを学習・評価する。
//! 設定は TOML ファイルで与え、個別の値はコマンドライン引数で上書きできる。

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use varcall_core::epoch::StopReason;
use varcall_core::{Dataset, SoftmaxHeads, TrainConfig, train_and_evaluate};

#[derive(Parser, Debug)]
#[command(name = "train_varcall")]
#[command(about = "Train the variant-calling classifier on a compressed dataset blob")]
struct Cli {
    /// データセット blob（create_mock_dataset などで生成）
    #[arg(long = "bin-fn", value_name = "PATH")]
    bin_fn: PathBuf,

    /// TOML 設定ファイル
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 初期学習率
    #[arg(long)]
    learning_rate: Option<f64>,

    /// 初期 L2 正則化係数
    #[arg(long)]
    lambd: Option<f64>,

    /// 学習バッチサイズ
    #[arg(long)]
    train_batch_size: Option<usize>,

    /// 検証・推論バッチサイズ
    #[arg(long)]
    predict_batch_size: Option<usize>,

    /// エポック番号の上限
    #[arg(long)]
    max_epoch: Option<usize>,

    /// 学習率減衰の最大回数
    #[arg(long)]
    max_decays: Option<u32>,

    /// 学習に使う先頭側の割合
    #[arg(long)]
    training_fraction: Option<f64>,

    /// 再開元チェックポイント
    #[arg(long = "chkpnt-fn", value_name = "PATH")]
    chkpnt_fn: Option<PathBuf>,

    /// チェックポイント出力プレフィックス
    #[arg(long = "ochk-prefix", value_name = "PREFIX")]
    ochk_prefix: Option<PathBuf>,

    /// JSONL サマリ出力先（"-" で stdout）
    #[arg(long)]
    summary_log: Option<String>,

    /// 評価レポートの JSON 出力先
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// モデル初期化のシード値
    #[arg(long)]
    seed: Option<u64>,
}

impl Cli {
    /// 設定ファイル（無ければデフォルト）に引数を上書き
    fn resolve_config(&self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => TrainConfig::default(),
        };
        if let Some(v) = self.learning_rate {
            config.learning_rate = v;
        }
        if let Some(v) = self.lambd {
            config.regularization_weight = v;
        }
        if let Some(v) = self.train_batch_size {
            config.train_batch_size = v;
        }
        if let Some(v) = self.predict_batch_size {
            config.predict_batch_size = v;
        }
        if let Some(v) = self.max_epoch {
            config.max_epoch = v;
        }
        if let Some(v) = self.max_decays {
            config.max_decays = v;
        }
        if let Some(v) = self.training_fraction {
            config.training_fraction = v;
        }
        if let Some(v) = &self.chkpnt_fn {
            config.resume_from = Some(v.clone());
        }
        if let Some(v) = &self.ochk_prefix {
            config.checkpoint_prefix = Some(v.clone());
        }
        if let Some(v) = &self.summary_log {
            config.summary_log = Some(v.clone());
        }
        if let Some(v) = &self.report_json {
            config.report_json = Some(v.clone());
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = cli.resolve_config()?;
    config.validate().context("invalid training configuration")?;
    log::debug!("effective config: {}", serde_json::to_string(&config)?);

    log::info!("Loading the dataset ...");
    let dataset = Dataset::load(&cli.bin_fn)
        .with_context(|| format!("failed to load dataset {}", cli.bin_fn.display()))?;
    if dataset.total() == 0 {
        bail!("dataset {} is empty", cli.bin_fn.display());
    }
    log::info!(
        "The size of training dataset: {} ({} features per example)",
        dataset.total(),
        dataset.feature_width()
    );

    let mut model = SoftmaxHeads::new(dataset.feature_width(), config.decay_factor);
    model.init_random(&mut Xoshiro256PlusPlus::seed_from_u64(config.seed));
    log::info!("Model parameters: {}", model.param_count());

    let run = train_and_evaluate(&config, &dataset, &mut model).context("training failed")?;

    let reason = match run.outcome.stop_reason {
        StopReason::MaxEpoch => "reached max epoch",
        StopReason::DecayBudgetExhausted => "learning rate decay budget exhausted",
    };
    log::info!(
        "Finished after {} epoch(s): {reason}",
        run.outcome.history.len()
    );
    if let Some(path) = &run.last_checkpoint {
        log::info!("Last checkpoint: {}", path.display());
    }
    Ok(())
}
