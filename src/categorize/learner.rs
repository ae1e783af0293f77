use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;

use super::state::LabelState;
use super::{CategorizeError, LoopParams, Oracle, RoundError};
use crate::classifier::{CategoryEncoder, Classifier, Example, model::seeded_rng};
use crate::track::{TrackArena, TrackId};

/// What one round did.
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round: usize,
    /// Labeled tracks the classifier was trained on.
    pub trained_on: usize,
    pub training_rows: usize,
    pub predicted: usize,
    pub promoted: usize,
    pub escalated: usize,
    /// Unlabeled tracks left after the round.
    pub remaining: usize,
    pub mean_confidence: Option<f64>,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub rounds: usize,
    /// Seeded plus escalated tracks.
    pub roots: usize,
    pub reports: Vec<RoundReport>,
    /// Share of non-root tracks whose predicted category matches the oracle.
    pub accuracy: Option<f64>,
}

pub struct ActiveLearner<O> {
    arena: TrackArena,
    encoder: CategoryEncoder,
    params: LoopParams,
    oracle: O,
    round: usize,
    rng: StdRng,
}

impl<O: Oracle> ActiveLearner<O> {
    pub fn new(
        arena: TrackArena,
        encoder: CategoryEncoder,
        params: LoopParams,
        oracle: O,
    ) -> Result<Self, CategorizeError> {
        if params.escalation_size == 0 {
            return Err(CategorizeError::InvalidEscalationSize);
        }
        let rng = seeded_rng(params.seed);
        Ok(Self {
            arena,
            encoder,
            params,
            oracle,
            round: 0,
            rng,
        })
    }

    /// Fit the category encoder from every label the oracle knows.
    pub fn from_oracle(arena: TrackArena, params: LoopParams, oracle: O) -> Result<Self, CategorizeError> {
        let labels: Vec<String> = arena.iter().filter_map(|t| oracle.true_category(t)).collect();
        let encoder = CategoryEncoder::fit(&labels).map_err(|_| CategorizeError::NoCategories)?;
        Self::new(arena, encoder, params, oracle)
    }

    pub fn arena(&self) -> &TrackArena {
        &self.arena
    }

    pub fn encoder(&self) -> &CategoryEncoder {
        &self.encoder
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn into_arena(self) -> TrackArena {
        self.arena
    }

    /// Mark up to `num_roots` tracks per category as roots, sampled when a
    /// category has more. With a bootstrap partition, the sample is spread
    /// across clusters before any cluster contributes a second track.
    pub fn seed_roots(&mut self, partition: Option<&BTreeMap<TrackId, usize>>) -> Result<usize, CategorizeError> {
        let mut by_category: BTreeMap<String, Vec<TrackId>> = BTreeMap::new();
        for track in self.arena.iter() {
            if let Some(category) = self.oracle.true_category(track) {
                by_category.entry(category).or_default().push(track.id);
            }
        }

        let mut seeded = 0;
        for (category, mut ids) in by_category {
            let chosen: Vec<TrackId> = if ids.len() <= self.params.num_roots {
                ids
            } else if let Some(partition) = partition {
                ids.shuffle(&mut self.rng);
                spread_across_clusters(&mut ids, partition);
                ids.truncate(self.params.num_roots);
                ids
            } else {
                ids.choose_multiple(&mut self.rng, self.params.num_roots)
                    .copied()
                    .collect()
            };

            for id in chosen {
                if self.arena.label(id).is_categorized() {
                    continue;
                }
                let state = LabelState::root(&category, &self.encoder)
                    .map_err(|e| CategorizeError::Seed(RoundError::Transition(e)))?;
                self.arena.set_label(id, state);
                seeded += 1;
            }
        }

        log::info!("Seeded {} root tracks across {} categories", seeded, self.encoder.len());
        Ok(seeded)
    }

    /// Train, predict, promote and escalate once.
    pub fn run_round(&mut self) -> Result<RoundReport, RoundError> {
        self.round += 1;
        let round = self.round;

        let labeled = self.arena.labeled();
        let unlabeled = self.arena.unlabeled();
        if unlabeled.is_empty() {
            return Ok(RoundReport {
                round,
                trained_on: labeled.len(),
                training_rows: 0,
                predicted: 0,
                promoted: 0,
                escalated: 0,
                remaining: 0,
                mean_confidence: None,
                accuracy: self.accuracy(),
            });
        }

        let classifier = {
            let mut examples = Vec::with_capacity(labeled.len());
            for &id in &labeled {
                let track = self.arena.get(id);
                let frames = track
                    .embedding
                    .frames
                    .as_ref()
                    .ok_or_else(|| RoundError::MissingFrames(track.name.clone()))?;
                let target = self
                    .arena
                    .label(id)
                    .category_encoded
                    .as_ref()
                    .ok_or_else(|| RoundError::MissingLabel(track.name.clone()))?;
                examples.push(Example {
                    frames: frames.view(),
                    target: target.view(),
                });
            }
            Classifier::train(self.encoder.clone(), &examples, &self.params.train, round)?
        };

        let mut promoted = 0;
        let mut confidences = Vec::with_capacity(unlabeled.len());
        for &id in &unlabeled {
            let track = self.arena.get(id);
            let frames = track
                .embedding
                .frames
                .as_ref()
                .ok_or_else(|| RoundError::MissingFrames(track.name.clone()))?;
            let prediction = classifier.predict(frames.view())?;
            log::debug!(
                "{}: {} (confidence {:.3})",
                track.name,
                prediction.category,
                prediction.confidence
            );
            confidences.push(prediction.confidence);

            let next = self.arena.label(id).clone().apply_prediction(
                &prediction,
                &self.encoder,
                self.params.threshold,
            )?;
            if next.is_categorized() {
                promoted += 1;
            }
            self.arena.set_label(id, next);
        }

        let escalated = self.escalate()?;
        let remaining = self.arena.unlabeled().len();
        let mean_confidence = (!confidences.is_empty())
            .then(|| confidences.iter().sum::<f64>() / confidences.len() as f64);

        log::info!(
            "Round {}: {} promoted, {} escalated, {} remaining",
            round,
            promoted,
            escalated,
            remaining
        );

        Ok(RoundReport {
            round,
            trained_on: labeled.len(),
            training_rows: classifier.state().training_size,
            predicted: unlabeled.len(),
            promoted,
            escalated,
            remaining,
            mean_confidence,
            accuracy: self.accuracy(),
        })
    }

    /// Hand the least confident unlabeled tracks (ties by name) to the oracle.
    fn escalate(&mut self) -> Result<usize, RoundError> {
        let mut candidates: Vec<(f64, &str, TrackId)> = self
            .arena
            .unlabeled()
            .into_iter()
            .map(|id| {
                let confidence = self.arena.label(id).confidence.unwrap_or(0.0);
                (confidence, self.arena.get(id).name.as_str(), id)
            })
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        let chosen: Vec<TrackId> = candidates
            .into_iter()
            .take(self.params.escalation_size)
            .map(|(_, _, id)| id)
            .collect();

        for &id in &chosen {
            let track = self.arena.get(id);
            let category = self
                .oracle
                .true_category(track)
                .ok_or_else(|| RoundError::OracleUnavailable(track.name.clone()))?;
            let next = self.arena.label(id).clone().escalate(&category, &self.encoder)?;
            self.arena.set_label(id, next);
        }
        Ok(chosen.len())
    }

    /// Run rounds until every track is categorized.
    ///
    /// Each round removes at least `escalation_size` tracks from the unlabeled
    /// set (or all that remain), so the loop ends within
    /// `ceil(unlabeled / escalation_size)` rounds.
    pub fn run(&mut self) -> Result<LoopOutcome, CategorizeError> {
        let mut reports = Vec::new();
        let mut unlabeled = self.arena.unlabeled().len();

        while unlabeled > 0 {
            log::info!("{} remaining tracks to categorize", unlabeled);
            let round = self.round + 1;
            let report = self
                .run_round()
                .map_err(|source| CategorizeError::Round { round, source })?;
            if report.remaining >= unlabeled {
                return Err(CategorizeError::Stalled {
                    round,
                    remaining: report.remaining,
                });
            }
            unlabeled = report.remaining;
            reports.push(report);
        }

        let roots = self.arena.ids().filter(|&id| self.arena.label(id).is_root()).count();
        Ok(LoopOutcome {
            rounds: reports.len(),
            roots,
            reports,
            accuracy: self.accuracy(),
        })
    }

    /// Share of categorized non-root tracks whose category matches the oracle.
    pub fn accuracy(&self) -> Option<f64> {
        let mut total = 0usize;
        let mut correct = 0usize;
        for track in self.arena.iter() {
            let label = self.arena.label(track.id);
            if label.is_root() || !label.is_categorized() {
                continue;
            }
            let Some(truth) = self.oracle.true_category(track) else {
                continue;
            };
            total += 1;
            if label.predicted_category.as_deref() == Some(truth.as_str()) {
                correct += 1;
            }
        }
        (total > 0).then(|| correct as f64 / total as f64)
    }
}

/// Reorder `ids` so the n-th track of every cluster comes before the
/// (n+1)-th track of any cluster. Relative order within a cluster is kept.
fn spread_across_clusters(ids: &mut [TrackId], partition: &BTreeMap<TrackId, usize>) {
    let mut seen: HashMap<Option<usize>, usize> = HashMap::new();
    let mut ranks: HashMap<TrackId, usize> = HashMap::with_capacity(ids.len());
    for &id in ids.iter() {
        let n = seen.entry(partition.get(&id).copied()).or_default();
        ranks.insert(id, *n);
        *n += 1;
    }
    ids.sort_by_key(|id| ranks[id]);
}
