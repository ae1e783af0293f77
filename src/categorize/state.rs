//! Per-track label state and its transitions.
//!
//! Every transition is a pure function from the current `LabelState` (plus a
//! prediction or an oracle answer) to the next one; the learner only decides
//! which transition to apply.

use ndarray::Array1;
use thiserror::Error;

use crate::classifier::{CategoryEncoder, ClassifierError, Prediction};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LabelStatus {
    #[default]
    Uncategorized,
    /// Has a prediction below the confidence threshold; still unlabeled.
    Predicted,
    /// Promoted prediction, used as training signal from now on.
    ConfidentlyCategorized,
    /// Ground truth supplied by the oracle.
    Root,
}

impl LabelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LabelStatus::Uncategorized => "uncategorized",
            LabelStatus::Predicted => "predicted",
            LabelStatus::ConfidentlyCategorized => "confident",
            LabelStatus::Root => "root",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uncategorized" => Some(LabelStatus::Uncategorized),
            "predicted" => Some(LabelStatus::Predicted),
            "confident" => Some(LabelStatus::ConfidentlyCategorized),
            "root" => Some(LabelStatus::Root),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelState {
    pub status: LabelStatus,
    pub category: Option<String>,
    pub category_encoded: Option<Array1<f32>>,
    pub predicted_category: Option<String>,
    /// Set only for promoted predictions.
    pub predicted_category_encoded: Option<Array1<f32>>,
    pub confidence: Option<f64>,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("Track is already categorized")]
    AlreadyCategorized,
    #[error(transparent)]
    Encode(#[from] ClassifierError),
}

impl LabelState {
    pub fn is_root(&self) -> bool {
        self.status == LabelStatus::Root
    }

    pub fn is_categorized(&self) -> bool {
        matches!(self.status, LabelStatus::Root | LabelStatus::ConfidentlyCategorized)
    }

    /// Initial seeding: the track becomes a root with its true category.
    pub fn root(category: &str, encoder: &CategoryEncoder) -> Result<Self, TransitionError> {
        let encoded = encoder.encode(category)?;
        Ok(Self {
            status: LabelStatus::Root,
            category: Some(category.to_string()),
            category_encoded: Some(encoded),
            predicted_category: Some(category.to_string()),
            predicted_category_encoded: None,
            confidence: None,
        })
    }

    /// Oracle escalation of a still-unlabeled track. The last prediction's
    /// confidence is kept for reporting.
    pub fn escalate(self, true_category: &str, encoder: &CategoryEncoder) -> Result<Self, TransitionError> {
        if self.is_categorized() {
            return Err(TransitionError::AlreadyCategorized);
        }
        let confidence = self.confidence;
        Ok(Self {
            confidence,
            ..Self::root(true_category, encoder)?
        })
    }

    /// Record a prediction; promote it when `confidence >= threshold`.
    pub fn apply_prediction(
        self,
        prediction: &Prediction,
        encoder: &CategoryEncoder,
        threshold: f64,
    ) -> Result<Self, TransitionError> {
        if self.is_categorized() {
            return Err(TransitionError::AlreadyCategorized);
        }

        if prediction.confidence >= threshold {
            let encoded = encoder.one_hot(prediction.category_index);
            Ok(Self {
                status: LabelStatus::ConfidentlyCategorized,
                category: Some(prediction.category.clone()),
                category_encoded: Some(encoded.clone()),
                predicted_category: Some(prediction.category.clone()),
                predicted_category_encoded: Some(encoded),
                confidence: Some(prediction.confidence),
            })
        } else {
            Ok(Self {
                status: LabelStatus::Predicted,
                category: None,
                category_encoded: None,
                predicted_category: Some(prediction.category.clone()),
                predicted_category_encoded: None,
                confidence: Some(prediction.confidence),
            })
        }
    }
}
