//! 常用类型.

pub use crate::axes::Axes;
pub use crate::config::{Algorithm, Configuration};
pub use crate::data::{read_array, Stats};
pub use crate::dataset::{
    Batch, DatasetOptions, InMemoryDataset, IterableDataset, PredictDataset, Sample, TrainingSource,
};
pub use crate::engine::{load_checkpoint, training_source, predict_dataset, Engine, Prediction, Stage};
pub use crate::loss::{HistogramNoiseModel, Loss, LossType};
pub use crate::manipulate::{N2vManipulate, StructMask};
pub use crate::model::{LinearFilter, Model};
pub use crate::patch::{extract_tiles, ExtractionStrategy, TileInfo};
pub use crate::stitch::stitch_prediction;
pub use crate::{Error, Result};
