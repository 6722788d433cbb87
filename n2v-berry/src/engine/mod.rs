//! 训练/推理引擎.
//!
//! [`Engine`] 持有配置, 模型, 损失与学习率调度器, 负责:
//!
//! 1. 逐 epoch 训练与验证, 按需写入检查点 (最新一份, 以及验证损失最好的一份);
//! 2. 整幅或分块推理, 分块结果按重叠区中点拼接回原图;
//! 3. 从检查点恢复.
//!
//! 训练可通过 [`Engine::stop_handle`] 从其他线程中断, 已完成的 epoch 记录会被保留.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::{ArrayD, Axis};

use crate::config::Configuration;
use crate::consts::{BEST_CHECKPOINT_NAME, CHECKPOINT_NAME};
use crate::data::{list_files, Stats};
use crate::dataset::{batches, InMemoryDataset, IterableDataset, PredictDataset, TrainingSource};
use crate::loss::{HistogramNoiseModel, Loss};
use crate::metrics::MetricTracker;
use crate::model::{Model, StepOptions};
use crate::patch::TileInfo;
use crate::stitch::stitch_prediction;
use crate::transforms::tta_predict;
use crate::{Error, Result};

mod checkpoint;
mod scheduler;

pub use checkpoint::{load_checkpoint, Checkpoint};
pub use scheduler::{LrScheduler, Scheduler};

/// 一个 epoch 的训练记录.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EpochRecord {
    /// epoch 序号, 从 0 开始.
    pub epoch: usize,

    /// 训练损失的样本加权平均.
    pub train_loss: f64,

    /// 验证损失的样本加权平均.
    pub val_loss: f64,

    /// 该 epoch 使用的学习率.
    pub learning_rate: f32,
}

/// 推理结果.
#[derive(Clone, Debug, Default)]
pub struct Prediction {
    /// 每个样本的预测, `(C, [Z], Y, X)`, 已反规范化.
    pub outputs: Vec<ArrayD<f32>>,

    /// 分块推理时拼接前的各 tile 预测. 整幅推理时为空.
    pub tiles: Vec<ArrayD<f32>>,
}

/// 训练/推理引擎.
pub struct Engine<M: Model> {
    config: Configuration,
    model: M,
    loss: Loss,
    scheduler: Scheduler,
    stats: Option<Stats>,
    history: Vec<EpochRecord>,
    best_val: f64,
    start_epoch: usize,
    stop: Arc<AtomicBool>,
}

impl<M: Model> Engine<M> {
    /// 校验配置并构建引擎. PN2V 需要噪声模型, 请改用 [`Engine::with_noise_model`].
    pub fn new(config: Configuration, model: M) -> Result<Self> {
        let loss = Loss::new(config.algorithm.loss)?;
        Self::with_loss(config, model, loss)
    }

    /// 以给定噪声模型构建 PN2V 引擎.
    pub fn with_noise_model(config: Configuration, model: M, noise_model: HistogramNoiseModel) -> Result<Self> {
        Self::with_loss(config, model, Loss::pn2v(noise_model))
    }

    fn with_loss(config: Configuration, model: M, loss: Loss) -> Result<Self> {
        config.validate()?;
        if loss.kind() != config.algorithm.loss {
            return Err(Error::Config(format!(
                "loss {:?} does not match configured {:?}",
                loss.kind(),
                config.algorithm.loss
            )));
        }
        log::info!(
            "Engine `{}`: {:?} with model `{}`",
            config.experiment_name,
            config.algorithm.algorithm,
            model.name()
        );
        Ok(Self {
            scheduler: Scheduler::new(config.training.scheduler, config.training.learning_rate),
            stats: config.data.stats,
            config,
            model,
            loss,
            history: vec![],
            best_val: f64::INFINITY,
            start_epoch: 0,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 从检查点重建引擎, 训练将从下一个 epoch 继续.
    pub fn from_checkpoint(ckpt: &Checkpoint, model: M) -> Result<Self> {
        let mut ans = Self::new(ckpt.config.clone(), model)?;
        ans.restore(ckpt)?;
        Ok(ans)
    }

    /// 配置.
    #[inline]
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// 模型.
    #[inline]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// 模型的可变引用.
    #[inline]
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// 规范化统计量. 训练前为配置中给出的值.
    #[inline]
    pub fn stats(&self) -> Option<Stats> {
        self.stats
    }

    /// 覆盖规范化统计量, 例如只做推理时.
    #[inline]
    pub fn set_stats(&mut self, stats: Stats) {
        self.stats = Some(stats);
    }

    /// 已完成 epoch 的记录.
    #[inline]
    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    /// 当前学习率.
    #[inline]
    pub fn learning_rate(&self) -> f32 {
        self.scheduler.learning_rate()
    }

    /// 中断标志. 置为 `true` 后, 训练在下一个 batch 前停止.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    #[inline]
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// 检查点目录: `working_directory/experiment_name`.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.config
            .working_directory
            .join(&self.config.experiment_name)
    }

    /// 训练至配置的 epoch 数, 返回全部 epoch 记录.
    ///
    /// 配置中给出统计量时以其为准, 否则使用训练集的统计量; 验证集总是使用同一统计量.
    pub fn train<T, V>(&mut self, train: &mut T, val: &mut V) -> Result<&[EpochRecord]>
    where
        T: TrainingSource + ?Sized,
        V: TrainingSource + ?Sized,
    {
        let stats = match self.config.data.stats {
            Some(s) => {
                train.set_stats(s);
                s
            }
            None => train.stats(),
        };
        val.set_stats(stats);
        self.stats = Some(stats);

        let epochs = self.config.training.num_epochs;
        log::info!(
            "Training epochs {}..{epochs}, {} samples per epoch",
            self.start_epoch,
            train
                .len_hint()
                .map_or_else(|| "unknown".to_string(), |n| n.to_string())
        );
        for epoch in self.start_epoch..epochs {
            let learning_rate = self.scheduler.learning_rate();
            let train_loss = match self.train_single_epoch(train, epoch)? {
                Some(l) => l,
                None => {
                    log::info!("Training interrupted at epoch {epoch}");
                    break;
                }
            };
            let val_loss = self.evaluate(val)?;
            let record = EpochRecord {
                epoch,
                train_loss,
                val_loss,
                learning_rate,
            };
            log::info!(
                "Epoch {epoch}: train loss {train_loss:.6}, val loss {val_loss:.6}, lr {learning_rate:e}"
            );
            self.history.push(record);
            self.scheduler.step(val_loss as f32);
            self.start_epoch = epoch + 1;

            if self.config.training.save_checkpoints {
                self.save_checkpoints(record)?;
            }
            if self.stopped() {
                log::info!("Training interrupted after epoch {epoch}");
                break;
            }
        }
        Ok(&self.history)
    }

    /// 训练一个 epoch, 返回平均损失. 被中断时返回 `None`.
    pub fn train_single_epoch<T: TrainingSource + ?Sized>(&mut self, train: &T, epoch: usize) -> Result<Option<f64>> {
        let opts = StepOptions {
            learning_rate: self.scheduler.learning_rate(),
            max_grad_norm: self.config.training.max_grad_norm,
        };
        let mut tracker = MetricTracker::default();
        for batch in batches(train.samples(epoch), self.config.training.batch_size) {
            if self.stopped() {
                return Ok(None);
            }
            let batch = batch?;
            let loss = self.model.train_step(&batch, &self.loss, &opts)?;
            tracker.update(f64::from(loss), batch.len());
        }
        if tracker.count() == 0 {
            return Err(Error::Empty(format!("no training sample in epoch {epoch}")));
        }
        Ok(Some(tracker.avg()))
    }

    /// 在验证集上计算平均损失. 验证集每次使用相同的随机状态.
    pub fn evaluate<V: TrainingSource + ?Sized>(&self, val: &V) -> Result<f64> {
        let mut tracker = MetricTracker::default();
        for batch in batches(val.samples(0), self.config.training.batch_size) {
            let batch = batch?;
            let pred = self.model.forward(batch.input.view())?;
            let mask = batch.mask.as_ref().map(|m| m.view());
            let loss = self.loss.compute(pred.view(), batch.target.view(), mask)?;
            tracker.update(f64::from(loss), batch.len());
        }
        if tracker.count() == 0 {
            return Err(Error::Empty("no validation sample".to_string()));
        }
        Ok(tracker.avg())
    }

    /// 当前状态的检查点.
    pub fn checkpoint(&self, epoch: usize, val_loss: f64) -> Result<Checkpoint> {
        let stats = self
            .stats
            .ok_or_else(|| Error::Config("no normalization statistics yet".to_string()))?;
        Ok(Checkpoint {
            epoch,
            val_loss,
            stats,
            learning_rate: self.scheduler.learning_rate(),
            state: self.model.state(),
            config: self.config.clone(),
        })
    }

    fn save_checkpoints(&mut self, record: EpochRecord) -> Result<()> {
        let dir = self.checkpoint_dir();
        fs::create_dir_all(&dir)?;
        let ckpt = self.checkpoint(record.epoch, record.val_loss)?;
        ckpt.save(dir.join(CHECKPOINT_NAME))?;
        if record.val_loss < self.best_val {
            self.best_val = record.val_loss;
            ckpt.save(dir.join(BEST_CHECKPOINT_NAME))?;
            log::info!("New best val loss {:.6} at epoch {}", record.val_loss, record.epoch);
        }
        Ok(())
    }

    /// 恢复模型参数, 统计量与学习率.
    pub fn restore(&mut self, ckpt: &Checkpoint) -> Result<()> {
        self.model.load_state(&ckpt.state)?;
        self.stats = Some(ckpt.stats);
        self.scheduler.set_learning_rate(ckpt.learning_rate);
        self.best_val = self.best_val.min(ckpt.val_loss);
        self.start_epoch = ckpt.epoch + 1;
        log::info!("Restored checkpoint of epoch {}", ckpt.epoch);
        Ok(())
    }

    /// 推理. 输入按训练统计量规范化, 输出再反规范化回原始强度.
    pub fn predict(&self, ds: &PredictDataset) -> Result<Prediction> {
        let stats = self.stats.ok_or_else(|| {
            Error::Config("prediction requires normalization statistics; train or set them first".to_string())
        })?;
        let batch_size = self.config.prediction.batch_size.max(1);
        let tta = self.config.prediction.tta;
        log::info!(
            "Predicting {} arrays ({}, tta {tta})",
            ds.len(),
            if ds.is_tiled() { "tiled" } else { "whole" }
        );

        let mut ans = Prediction::default();
        let mut first_sample = 0;
        for index in 0..ds.len() {
            let array = ds.load(index)?;
            let items = ds.items(&array, first_sample)?;
            first_sample += array.len_of(Axis(0));

            let mut preds = Vec::with_capacity(items.len());
            for chunk in items.chunks(batch_size) {
                let views: Vec<_> = chunk.iter().map(|i| i.input.view()).collect();
                let mut input = ndarray::stack(Axis(0), &views)?;
                stats.normalize_inplace(&mut input);
                let mut out = if tta {
                    tta_predict(&input, |x| self.model.forward(x.view()))?
                } else {
                    self.model.forward(input.view())?
                };
                if out.shape() != input.shape() {
                    return Err(Error::Dimension {
                        expected: format!("model output of shape {:?}", input.shape()),
                        shape: out.shape().to_vec(),
                    });
                }
                stats.denormalize_inplace(&mut out);
                preds.extend(out.axis_iter(Axis(0)).map(|v| v.to_owned()));
            }

            if ds.is_tiled() {
                let infos: Vec<TileInfo> = items.into_iter().filter_map(|i| i.tile).collect();
                ans.outputs.extend(stitch_prediction(&preds, &infos)?);
                ans.tiles.extend(preds);
            } else {
                ans.outputs.extend(preds);
            }
        }
        Ok(ans)
    }
}

/// 训练/验证所需的数据路径.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    /// 训练集.
    Train,

    /// 验证集. 未配置验证路径时使用训练数据.
    Validation,
}

fn missing_path(what: &str) -> Error {
    Error::Config(format!("no {what} path configured"))
}

/// 按配置构建训练或验证数据源. 逐文件数据集会在此遍历一次数据以计算统计量.
pub fn training_source(config: &Configuration, stage: Stage) -> Result<Box<dyn TrainingSource>> {
    let data = &config.data;
    let (path, target_path, opts) = match (stage, &data.val_path) {
        (Stage::Validation, Some(p)) => (p, data.val_target_path.as_ref(), config.val_dataset_options()?),
        (Stage::Validation, None) => (
            data.train_path.as_ref().ok_or_else(|| missing_path("training"))?,
            data.train_target_path.as_ref(),
            config.val_dataset_options()?,
        ),
        (Stage::Train, _) => (
            data.train_path.as_ref().ok_or_else(|| missing_path("training"))?,
            data.train_target_path.as_ref(),
            config.dataset_options()?,
        ),
    };
    let files = list_files(path, &data.extension)?;
    let target_files = target_path
        .map(|p| list_files(p, &data.extension))
        .transpose()?;

    if data.in_memory {
        let ds = InMemoryDataset::from_files(&files, target_files.as_deref(), &data.axes, &opts)?;
        return Ok(Box::new(ds));
    }
    let mut ds = IterableDataset::new(files, target_files, data.axes.clone(), opts)?;
    match data.stats {
        Some(s) => ds.set_stats(s),
        None if config.training.running_stats => {
            ds.compute_running_stats()?;
        }
        None => {
            ds.compute_stats()?;
        }
    }
    Ok(Box::new(ds))
}

/// 按配置构建推理数据集.
pub fn predict_dataset(config: &Configuration) -> Result<PredictDataset> {
    let path = config.data.predict_path.as_ref().ok_or_else(|| missing_path("prediction"))?;
    let files = list_files(path, &config.data.extension)?;
    let ds = PredictDataset::from_files(files, config.data.axes.clone());
    let p = &config.prediction;
    Ok(match (&p.tile_size, &p.tile_overlap) {
        (Some(t), Some(o)) => ds.with_tiling(t.clone(), o.clone()),
        _ => ds,
    })
}
