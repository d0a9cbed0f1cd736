//! Seams to the model-training collaborator.

use std::sync::Arc;

use thiserror::Error;

use crate::historical::TrainingTable;
use crate::primitive::Value;
use crate::spec::ModelSpec;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ModelError(pub String);

/// Named columns of nullable cells handed to trainers and predictors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<Value>>>,
}

impl FeatureBatch {
    pub fn column(&self, name: &str) -> Option<Vec<Option<&Value>>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row[idx].as_ref()).collect())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Batch inference. One output value per input row.
pub trait Predictor: Send + Sync {
    fn predict(&self, batch: &FeatureBatch) -> Result<Vec<Value>, ModelError>;
}

impl<F> Predictor for F
where
    F: Fn(&FeatureBatch) -> Result<Vec<Value>, ModelError> + Send + Sync,
{
    fn predict(&self, batch: &FeatureBatch) -> Result<Vec<Value>, ModelError> {
        self(batch)
    }
}

pub trait Trainer {
    fn train(&self, ctx: &TrainingContext) -> Result<Box<dyn Predictor>, ModelError>;
}

impl<F> Trainer for F
where
    F: Fn(&TrainingContext) -> Result<Box<dyn Predictor>, ModelError>,
{
    fn train(&self, ctx: &TrainingContext) -> Result<Box<dyn Predictor>, ModelError> {
        self(ctx)
    }
}

/// Everything a trainer may read about the model it trains.
#[derive(Debug, Clone)]
pub struct TrainingContext {
    model: Arc<ModelSpec>,
    table: TrainingTable,
    features: Vec<String>,
    labels: Vec<String>,
}

impl TrainingContext {
    pub fn new(
        model: Arc<ModelSpec>,
        table: TrainingTable,
        features: Vec<String>,
        labels: Vec<String>,
    ) -> Self {
        Self {
            model,
            table,
            features,
            labels,
        }
    }

    pub fn model(&self) -> &ModelSpec {
        &self.model
    }

    /// Feature columns first, in the order predictions receive them.
    pub fn feature_columns(&self) -> &[String] {
        &self.features
    }

    pub fn label_columns(&self) -> &[String] {
        &self.labels
    }

    /// Splits the joined training table into the feature matrix and the labels.
    pub fn features_and_labels(&self) -> (FeatureBatch, FeatureBatch) {
        (self.select(&self.features), self.select(&self.labels))
    }

    fn select(&self, names: &[String]) -> FeatureBatch {
        let idx: Vec<usize> = names
            .iter()
            .filter_map(|name| self.table.columns().iter().position(|c| c == name))
            .collect();
        FeatureBatch {
            columns: idx.iter().map(|i| self.table.columns()[*i].clone()).collect(),
            rows: self
                .table
                .rows()
                .iter()
                .map(|row| idx.iter().map(|i| row[*i].clone()).collect())
                .collect(),
        }
    }
}
