//! Supervised training loop with warmup, checkpointing, and metric events
//!
//! The loop owns its [`TrainingState`] for the duration of a run and walks a
//! fixed state machine: `Idle → Warmup → Training → Completed | Failed`.
//! Each step performs a forward pass, masked next-token loss, backward pass,
//! optimizer step, and learning-rate schedule update. A checkpoint is written
//! at every epoch boundary, never mid-epoch. Metrics leave the loop as
//! [`TrainingEvent`] values over an optional channel; resubscription is a
//! matter of attaching a new sender before the next run.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{ops::log_softmax, AdamW, Optimizer, ParamsAdamW};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::JobConfig;
use crate::data::PreparedDataset;
use crate::error::{Error, Result};
use crate::model::CausalLm;

/// Phase of the training state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrainingStatus {
    /// Not yet started
    Idle,
    /// Ramping the learning rate over the configured warmup steps
    Warmup,
    /// Steady-state optimization
    Training,
    /// All epochs finished
    Completed,
    /// A step failed; the loop position is preserved in the state
    Failed {
        /// Description of the failure
        reason: String,
    },
}

/// Mutable loop state, owned solely by the trainer during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch (zero-based)
    pub epoch: usize,
    /// Global step across all epochs; strictly increasing
    pub global_step: usize,
    /// Loss of the most recent step
    pub last_loss: f64,
    /// Current phase
    pub status: TrainingStatus,
}

impl TrainingState {
    fn new() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            last_loss: 0.0,
            status: TrainingStatus::Idle,
        }
    }
}

/// Events emitted by the loop for monitoring and metric capture
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    /// An epoch began
    EpochStarted {
        /// Zero-based epoch index
        epoch: usize,
    },
    /// A step finished; emitted at the configured logging cadence
    StepCompleted {
        /// Global step, starting at 1
        step: usize,
        /// Step loss
        loss: f64,
        /// Learning rate applied to this step
        lr: f64,
    },
    /// An epoch finished
    EpochCompleted {
        /// Zero-based epoch index
        epoch: usize,
        /// Global step at the boundary
        step: usize,
        /// Mean loss over the epoch
        mean_loss: f64,
    },
    /// An epoch-boundary checkpoint was written
    CheckpointSaved {
        /// Checkpoint directory
        path: PathBuf,
    },
}

/// Terminal result of a completed run
#[derive(Debug, Clone)]
pub struct TrainResult {
    /// Loss of the final step
    pub final_loss: f64,
    /// Wall-clock training time
    pub runtime: Duration,
    /// Total steps taken; equals `epochs * ceil(records / batch_size)`
    pub total_steps: usize,
    /// Checkpoint directories written, one per epoch
    pub checkpoints: Vec<PathBuf>,
}

/// Sidecar metadata written next to every checkpoint's weights
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    epoch: usize,
    global_step: usize,
    mean_loss: f64,
    saved_at: DateTime<Utc>,
}

/// Linear warmup followed by linear decay to zero
struct LrSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LrSchedule {
    /// Learning rate for the step following `completed` finished steps
    fn lr_at(&self, completed: usize) -> f64 {
        if completed < self.warmup_steps {
            self.base_lr * (completed + 1) as f64 / self.warmup_steps as f64
        } else if self.total_steps > self.warmup_steps {
            let decay_steps = (self.total_steps - self.warmup_steps) as f64;
            let progress = (completed - self.warmup_steps) as f64 / decay_steps;
            self.base_lr * (1.0 - progress.min(1.0))
        } else {
            self.base_lr
        }
    }
}

/// Epoch/step training loop over a prepared dataset
pub struct Trainer<'a> {
    model: &'a dyn CausalLm,
    device: &'a Device,
    dataset: &'a PreparedDataset,
    config: &'a JobConfig,
    state: TrainingState,
    event_tx: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

impl<'a> Trainer<'a> {
    /// Create a trainer over the given model and dataset
    pub fn new(
        model: &'a dyn CausalLm,
        device: &'a Device,
        dataset: &'a PreparedDataset,
        config: &'a JobConfig,
    ) -> Self {
        Self {
            model,
            device,
            dataset,
            config,
            state: TrainingState::new(),
            event_tx: None,
        }
    }

    /// Attach a metric event sink
    pub fn with_event_sink(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Current loop state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Run the full epoch/step loop
    ///
    /// Any step failure transitions the state machine to `Failed` and returns
    /// [`Error::Training`] carrying the epoch and step reached; retry policy
    /// belongs to the caller.
    pub fn run(&mut self) -> Result<TrainResult> {
        let training = &self.config.training;
        let batch_size = training.batch_size;
        let steps_per_epoch = self.dataset.num_batches(batch_size);
        let total_steps = training.num_epochs * steps_per_epoch;

        info!(
            "Starting training: {} epochs, {} records, {} steps",
            training.num_epochs,
            self.dataset.len(),
            total_steps
        );

        let schedule = LrSchedule {
            base_lr: training.learning_rate,
            warmup_steps: training.warmup_steps,
            total_steps,
        };

        let vars = self.model.trainable_vars();
        if vars.is_empty() {
            return Err(self.fail("model exposes no trainable variables"));
        }
        let mut optimizer = match AdamW::new(
            vars,
            ParamsAdamW {
                lr: schedule.lr_at(0),
                weight_decay: training.weight_decay,
                ..Default::default()
            },
        ) {
            Ok(optimizer) => optimizer,
            Err(e) => return Err(self.fail(e)),
        };

        self.state.status = TrainingStatus::Warmup;
        let start = Instant::now();
        let mut checkpoints = Vec::with_capacity(training.num_epochs);

        for epoch in 0..training.num_epochs {
            self.state.epoch = epoch;
            debug!("Starting epoch {}/{}", epoch + 1, training.num_epochs);
            self.emit(TrainingEvent::EpochStarted { epoch });

            let mut epoch_loss = 0.0;
            let mut epoch_batches = 0;

            for batch in self.dataset.batches(batch_size, self.device) {
                let loss = match batch
                    .and_then(|(ids, mask)| self.train_step(&ids, &mask, &mut optimizer))
                {
                    Ok(loss) => loss,
                    Err(e) => return Err(self.fail(e)),
                };

                self.state.global_step += 1;
                self.state.last_loss = loss;
                epoch_loss += loss;
                epoch_batches += 1;

                if self.state.status == TrainingStatus::Warmup
                    && self.state.global_step >= training.warmup_steps
                {
                    self.state.status = TrainingStatus::Training;
                }

                let lr = optimizer.learning_rate();
                optimizer.set_learning_rate(schedule.lr_at(self.state.global_step));

                if self.state.global_step % training.logging_steps == 0 {
                    debug!(
                        "Step {} - loss {:.4}, lr {:.2e}",
                        self.state.global_step, loss, lr
                    );
                    self.emit(TrainingEvent::StepCompleted {
                        step: self.state.global_step,
                        loss,
                        lr,
                    });
                }
            }

            let mean_loss = epoch_loss / epoch_batches.max(1) as f64;
            let checkpoint = match self.save_checkpoint(epoch, mean_loss) {
                Ok(path) => path,
                Err(e) => return Err(self.fail(e)),
            };
            info!(
                "Epoch {}/{} completed - mean loss {:.4}, checkpoint {}",
                epoch + 1,
                training.num_epochs,
                mean_loss,
                checkpoint.display()
            );
            self.emit(TrainingEvent::CheckpointSaved {
                path: checkpoint.clone(),
            });
            self.emit(TrainingEvent::EpochCompleted {
                epoch,
                step: self.state.global_step,
                mean_loss,
            });
            checkpoints.push(checkpoint);
        }

        self.state.status = TrainingStatus::Completed;
        let runtime = start.elapsed();
        info!(
            "Training completed: {} steps in {:.1}s",
            self.state.global_step,
            runtime.as_secs_f64()
        );

        Ok(TrainResult {
            final_loss: self.state.last_loss,
            runtime,
            total_steps: self.state.global_step,
            checkpoints,
        })
    }

    /// One optimization step; returns the scalar loss
    fn train_step(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        optimizer: &mut AdamW,
    ) -> Result<f64> {
        let logits = self.model.forward(input_ids)?;
        let loss = causal_lm_loss(&logits, input_ids, attention_mask)?;
        optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()? as f64)
    }

    /// Write the epoch-boundary checkpoint
    fn save_checkpoint(&self, epoch: usize, mean_loss: f64) -> Result<PathBuf> {
        let dir = self
            .config
            .training
            .output_dir
            .join(format!("checkpoint-epoch-{}", epoch + 1));
        self.model.save(&dir)?;

        let record = CheckpointRecord {
            epoch,
            global_step: self.state.global_step,
            mean_loss,
            saved_at: Utc::now(),
        };
        fs::write(dir.join("state.json"), serde_json::to_string_pretty(&record)?)?;
        Ok(dir)
    }

    /// Record the failure position and build the terminal training error
    fn fail(&mut self, reason: impl std::fmt::Display) -> Error {
        let reason = reason.to_string();
        self.state.status = TrainingStatus::Failed {
            reason: reason.clone(),
        };
        Error::training(self.state.epoch, self.state.global_step, reason)
    }

    fn emit(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

/// Masked next-token cross-entropy over a batch
///
/// Targets are the input ids shifted by one; positions whose target is
/// padding are excluded from the mean.
fn causal_lm_loss(logits: &Tensor, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let (_batch, seq_len, _vocab) = logits.dims3()?;
    if seq_len < 2 {
        return Err(Error::data(
            "next-token loss needs sequences of at least 2 tokens",
        ));
    }

    let preds = logits.narrow(1, 0, seq_len - 1)?;
    let targets = input_ids.narrow(1, 1, seq_len - 1)?;
    let mask = attention_mask
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::F32)?;

    let log_probs = log_softmax(&preds, D::Minus1)?.contiguous()?;
    let picked = log_probs
        .gather(&targets.unsqueeze(2)?.contiguous()?, 2)?
        .squeeze(2)?;
    let masked = picked.mul(&mask)?;

    let token_count = mask.sum_all()?.to_scalar::<f32>()? as f64;
    if token_count <= 0.0 {
        return Err(Error::data("batch contains no unmasked target tokens"));
    }
    let loss = masked.sum_all()?.neg()?.affine(1.0 / token_count, 0.0)?;
    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, tiny_model, FailingModel};
    use tempfile::TempDir;

    #[test]
    fn step_count_matches_epochs_times_batches() {
        let out = TempDir::new().unwrap();
        let model = tiny_model();
        let dataset = fixtures::synthetic_dataset(8, 8);
        let config = fixtures::job_config("m", "d", out.path());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut trainer =
            Trainer::new(&model, &Device::Cpu, &dataset, &config).with_event_sink(tx);
        let result = trainer.run().unwrap();

        // 2 epochs * ceil(8 / 4) batches.
        assert_eq!(result.total_steps, 4);
        assert_eq!(result.checkpoints.len(), 2);
        assert!(result.final_loss.is_finite());
        assert_eq!(trainer.state().status, TrainingStatus::Completed);

        drop(trainer);
        let mut step_events = Vec::new();
        let mut per_epoch = vec![0usize; 2];
        let mut epoch = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                TrainingEvent::StepCompleted { step, .. } => {
                    step_events.push(step);
                    per_epoch[epoch] += 1;
                }
                TrainingEvent::EpochCompleted { .. } => epoch += 1,
                _ => {}
            }
        }
        // logging_steps=1: every step logged, strictly increasing, 2 per epoch.
        assert_eq!(step_events, vec![1, 2, 3, 4]);
        assert_eq!(per_epoch, vec![2, 2]);
    }

    #[test]
    fn partial_final_batch_is_kept() {
        let out = TempDir::new().unwrap();
        let model = tiny_model();
        let dataset = fixtures::synthetic_dataset(10, 8);
        let mut config = fixtures::job_config("m", "d", out.path());
        config.training.num_epochs = 1;

        let mut trainer = Trainer::new(&model, &Device::Cpu, &dataset, &config);
        let result = trainer.run().unwrap();
        assert_eq!(result.total_steps, 3); // ceil(10 / 4)
    }

    #[test]
    fn checkpoints_are_written_per_epoch() {
        let out = TempDir::new().unwrap();
        let model = tiny_model();
        let dataset = fixtures::synthetic_dataset(8, 8);
        let config = fixtures::job_config("m", "d", out.path());

        let mut trainer = Trainer::new(&model, &Device::Cpu, &dataset, &config);
        let result = trainer.run().unwrap();

        for (n, path) in result.checkpoints.iter().enumerate() {
            assert_eq!(
                path.file_name().unwrap().to_str().unwrap(),
                format!("checkpoint-epoch-{}", n + 1)
            );
            assert!(path.join("model.safetensors").exists());
            let state: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(path.join("state.json")).unwrap())
                    .unwrap();
            assert_eq!(state["epoch"], n as u64);
        }
    }

    #[test]
    fn warmup_ramps_then_decays() {
        let schedule = LrSchedule {
            base_lr: 1.0,
            warmup_steps: 4,
            total_steps: 8,
        };
        assert!(schedule.lr_at(0) > 0.0);
        assert!(schedule.lr_at(0) < schedule.lr_at(2));
        assert_eq!(schedule.lr_at(3), 1.0);
        assert!(schedule.lr_at(5) < 1.0);
        assert_eq!(schedule.lr_at(8), 0.0);
    }

    #[test]
    fn step_failure_preserves_loop_position() {
        let out = TempDir::new().unwrap();
        // 3 epochs over 100 records at batch 4 = 25 steps per epoch; fail on
        // the first forward of epoch 2.
        let model = FailingModel::new(tiny_model(), 25);
        let dataset = fixtures::synthetic_dataset(100, 8);
        let mut config = fixtures::job_config("m", "d", out.path());
        config.training.num_epochs = 3;

        let mut trainer = Trainer::new(&model, &Device::Cpu, &dataset, &config);
        let err = trainer.run().unwrap_err();

        match err {
            Error::Training { epoch, step, .. } => {
                assert_eq!(epoch, 1);
                assert_eq!(step, 25);
            }
            other => panic!("expected training error, got {other}"),
        }
        assert!(matches!(
            trainer.state().status,
            TrainingStatus::Failed { .. }
        ));
        // Exactly the epoch-1 checkpoint exists.
        assert!(out.path().join("checkpoint-epoch-1").exists());
        assert!(!out.path().join("checkpoint-epoch-2").exists());
    }

    #[test]
    fn loss_ignores_padded_positions() {
        let device = Device::Cpu;
        let model = tiny_model();
        let ids = Tensor::from_vec(vec![2u32, 3, 4, 1, 1, 1], (1, 6), &device).unwrap();
        let mask_full = Tensor::from_vec(vec![1u32; 6], (1, 6), &device).unwrap();
        let mask_padded = Tensor::from_vec(vec![1u32, 1, 1, 0, 0, 0], (1, 6), &device).unwrap();

        let logits = model.forward(&ids).unwrap();
        let full = causal_lm_loss(&logits, &ids, &mask_full)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let padded = causal_lm_loss(&logits, &ids, &mask_padded)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(full.is_finite() && padded.is_finite());
        assert_ne!(full, padded);
    }
}
