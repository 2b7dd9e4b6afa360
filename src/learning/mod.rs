//! Learning loop: drift detection over stored outcomes, model training,
//! and gated retrain orchestration.

pub mod drift;
pub mod retrain;
pub mod trainer;

pub use drift::{default_monitored_features, DriftConfig, DriftDetector, DriftReport};
pub use retrain::{RetrainAction, RetrainOrchestrator, RetrainReport, SweepSummary};
pub use trainer::{Dataset, TrainConfig, TrainedModel};
