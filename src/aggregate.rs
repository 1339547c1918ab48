use ndarray::{Array1, Zip};

use crate::{
    config::AggregatorConfig,
    error::{ConfigError, MetaError, Result},
    kernel::ModeledActivationMap,
    math::{one_sample_g, two_sample_g},
    results::{GroupStatisticMap, Tail},
};

/// Reduces per-study modeled activation maps to one group statistic per voxel.
///
/// Every rule is a commutative reduction over studies, so any ordering of the
/// same studies gives the same map up to floating-point rounding.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    config: AggregatorConfig,
}
impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> AggregatorConfig {
        self.config
    }

    pub fn tail(&self) -> Tail {
        match self.config {
            AggregatorConfig::Union | AggregatorConfig::Sum { .. } => Tail::Upper,
            AggregatorConfig::Specificity => Tail::TwoSided,
        }
    }

    /// Validates the maps and computes the group statistic.
    ///
    /// `reference` is only meaningful for the specificity contrast.
    pub fn aggregate(
        &self,
        target: &[ModeledActivationMap],
        reference: Option<&[ModeledActivationMap]>,
    ) -> Result<GroupStatisticMap> {
        if target.is_empty() {
            return Err(MetaError::input("studies", "no studies supplied"));
        }
        let n_voxels = target[0].values.len();
        for map in target.iter().chain(reference.unwrap_or(&[]).iter()) {
            if map.values.len() != n_voxels {
                return Err(MetaError::input(
                    &map.study_id,
                    format!("map has {} voxels, expected {n_voxels}", map.values.len()),
                ));
            }
        }
        match (self.config, reference) {
            (AggregatorConfig::Specificity, Some([])) => {
                return Err(MetaError::input("reference", "no reference studies supplied"))
            }
            (AggregatorConfig::Union | AggregatorConfig::Sum { .. }, Some(_)) => {
                return Err(ConfigError::Incompatible(
                    "only the specificity aggregator accepts a reference study set".to_string(),
                )
                .into())
            }
            _ => {}
        }
        if self.config == AggregatorConfig::Union {
            for map in target {
                if map.values.iter().any(|v| !(0.0..=1.0).contains(v)) {
                    return Err(MetaError::input(
                        &map.study_id,
                        "union aggregation needs modeled activation values in [0, 1]",
                    ));
                }
            }
        }

        let weights = self.weights(target)?;
        let target_values = target.iter().map(|m| &m.values).collect::<Vec<_>>();
        let reference_values =
            reference.map(|maps| maps.iter().map(|m| &m.values).collect::<Vec<_>>());
        let values = self.statistic(&target_values, &weights, reference_values.as_deref());
        Ok(GroupStatisticMap::new(values, self.tail()))
    }

    /// Per-study weights for the sum rule; 1 for every other rule.
    pub fn weights(&self, maps: &[ModeledActivationMap]) -> Result<Vec<f64>> {
        match self.config {
            AggregatorConfig::Sum { weighting } => maps
                .iter()
                .map(|map| {
                    weighting.weight(map.sample_size).ok_or_else(|| {
                        MetaError::input(&map.study_id, "sample-size weighting needs a sample size")
                    })
                })
                .collect(),
            _ => Ok(vec![1.0; maps.len()]),
        }
    }

    /// The raw statistic, without input validation.
    pub(crate) fn statistic(
        &self,
        target: &[&Array1<f64>],
        weights: &[f64],
        reference: Option<&[&Array1<f64>]>,
    ) -> Array1<f64> {
        let n_voxels = target.first().map(|m| m.len()).unwrap_or(0);
        match self.config {
            AggregatorConfig::Union => {
                let mut complement = Array1::<f64>::ones(n_voxels);
                for map in target {
                    Zip::from(&mut complement)
                        .and(*map)
                        .for_each(|c, ma| *c *= 1.0 - ma);
                }
                complement.mapv(|c| 1.0 - c)
            }
            AggregatorConfig::Sum { .. } => {
                let mut total = Array1::<f64>::zeros(n_voxels);
                for (map, weight) in target.iter().zip(weights.iter()) {
                    total.scaled_add(*weight, *map);
                }
                total
            }
            AggregatorConfig::Specificity => {
                let target_active = active_counts(target, n_voxels);
                let n_target = target.len() as f64;
                match reference {
                    Some(reference) => {
                        let reference_active = active_counts(reference, n_voxels);
                        let n_reference = reference.len() as f64;
                        Zip::from(&target_active)
                            .and(&reference_active)
                            .map_collect(|a, c| two_sample_g(*a, n_target, *c, n_reference))
                    }
                    None => {
                        let rate = target_active.mean().unwrap_or(0.0) / n_target;
                        target_active.mapv(|a| one_sample_g(a, n_target, rate))
                    }
                }
            }
        }
    }
}

fn active_counts(maps: &[&Array1<f64>], n_voxels: usize) -> Array1<f64> {
    let mut counts = Array1::<f64>::zeros(n_voxels);
    for map in maps {
        Zip::from(&mut counts).and(*map).for_each(|count, ma| {
            if *ma > 0.0 {
                *count += 1.0;
            }
        });
    }
    counts
}
