use itertools::Itertools;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    aggregate::Aggregator, cluster::ClusterLabels, error::Result, mask::Mask,
    montecarlo::worker_pool, null::StudySet,
};

/// Per-study, per-cluster diagnostic applied to a thresholded result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// Leave-one-study-out share of each cluster's statistic.
    Jackknife,
    /// Number of each study's foci falling inside each cluster.
    FocusCounter,
}
impl Diagnostic {
    pub fn label(&self) -> &'static str {
        match self {
            Diagnostic::Jackknife => "jackknife",
            Diagnostic::FocusCounter => "focus-counter",
        }
    }

    /// Jackknife refits run on a pool of `n_workers` threads.
    pub fn run(
        &self,
        mask: &Mask,
        aggregator: &Aggregator,
        studies: &StudySet,
        labels: &ClusterLabels,
        n_workers: Option<usize>,
    ) -> Result<ContributionTable> {
        info!(
            diagnostic = self.label(),
            n_clusters = labels.clusters.len(),
            "Running diagnostics..."
        );
        match self {
            Diagnostic::Jackknife => {
                let pool = worker_pool(n_workers)?;
                Ok(pool.install(|| jackknife(aggregator, studies, labels)))
            }
            Diagnostic::FocusCounter => Ok(focus_counter(mask, studies, labels)),
        }
    }
}

/// Studies by clusters.
#[derive(Debug, Clone)]
pub struct ContributionTable {
    pub diagnostic: Diagnostic,
    pub study_ids: Vec<String>,
    /// 1-based cluster ids, matching the cluster labels.
    pub cluster_ids: Vec<usize>,
    /// `values[[study, cluster]]`
    pub values: Array2<f64>,
}
impl ContributionTable {
    pub fn get(&self, study_id: &str, cluster_id: usize) -> Option<f64> {
        let row = self.study_ids.iter().position(|id| id == study_id)?;
        let col = self.cluster_ids.iter().position(|id| *id == cluster_id)?;
        Some(self.values[[row, col]])
    }

    pub fn pprint(&self) {
        let header = self
            .cluster_ids
            .iter()
            .map(|id| format!("Cluster {id}"))
            .join("\t");
        println!("Study\t{header}");
        for (row, id) in self.study_ids.iter().enumerate() {
            println!("{id}\t{}", self.values.row(row).iter().join("\t"));
        }
    }
}

/// For each study, the statistic is recomputed without it. Its contribution
/// to a cluster is the mean over cluster voxels of `1 - stat_without / stat`.
fn jackknife(
    aggregator: &Aggregator,
    studies: &StudySet,
    labels: &ClusterLabels,
) -> ContributionTable {
    let target = &studies.target;
    let all = target.maps.iter().map(|m| &m.values).collect::<Vec<_>>();
    let reference = studies
        .reference
        .as_ref()
        .map(|r| r.maps.iter().map(|m| &m.values).collect::<Vec<_>>());
    let full = aggregator.statistic(&all, &target.weights, reference.as_deref());

    let rows = (0..all.len())
        .into_par_iter()
        .map(|left_out| {
            let maps = all
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != left_out)
                .map(|(_, m)| *m)
                .collect::<Vec<_>>();
            let weights = target
                .weights
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != left_out)
                .map(|(_, w)| *w)
                .collect::<Vec<_>>();
            let without = if maps.is_empty() {
                Array1::zeros(full.len())
            } else {
                aggregator.statistic(&maps, &weights, reference.as_deref())
            };
            labels
                .clusters
                .iter()
                .map(|cluster| {
                    let total = cluster
                        .voxels
                        .iter()
                        .map(|v| share(full[*v], without[*v]))
                        .sum::<f64>();
                    total / cluster.size() as f64
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    debug!(n_refits = rows.len(), "jackknife refits complete");

    build_table(Diagnostic::Jackknife, studies, labels, rows)
}

fn share(full: f64, without: f64) -> f64 {
    if full == 0.0 {
        0.0
    } else {
        1.0 - without / full
    }
}

fn focus_counter(mask: &Mask, studies: &StudySet, labels: &ClusterLabels) -> ContributionTable {
    let rows = studies
        .target
        .prepared
        .iter()
        .map(|study| {
            let mut counts = vec![0.0; labels.clusters.len()];
            for focus in study.foci() {
                let label = mask.position(*focus).map(|p| labels.labels[p]).unwrap_or(0);
                if label > 0 {
                    counts[label - 1] += 1.0;
                }
            }
            counts
        })
        .collect::<Vec<_>>();
    build_table(Diagnostic::FocusCounter, studies, labels, rows)
}

fn build_table(
    diagnostic: Diagnostic,
    studies: &StudySet,
    labels: &ClusterLabels,
    rows: Vec<Vec<f64>>,
) -> ContributionTable {
    let n_clusters = labels.clusters.len();
    let mut values = Array2::zeros((rows.len(), n_clusters));
    for (i, row) in rows.iter().enumerate() {
        for (j, v) in row.iter().enumerate() {
            values[[i, j]] = *v;
        }
    }
    ContributionTable {
        diagnostic,
        study_ids: studies
            .target
            .maps
            .iter()
            .map(|m| m.study_id.clone())
            .collect(),
        cluster_ids: (1..=n_clusters).collect(),
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::label_clusters,
        config::{
            AggregatorConfig, Connectivity, KernelConfig, KernelSettings, SphereDensity,
            StudyWeighting,
        },
        kernel::SpatialKernelTransformer,
        mask::Affine,
        results::Tail,
        study::{Focus, Study},
    };
    use approx::assert_relative_eq;

    struct Fixture {
        mask: Mask,
        aggregator: Aggregator,
        set: StudySet,
        labels: ClusterLabels,
    }

    /// Two studies share a cluster at one corner; a third study is alone at the
    /// opposite corner.
    fn fixture() -> Fixture {
        let mask = Mask::full([10, 10, 10], Affine::isotropic(2.0, [0.0; 3]).unwrap()).unwrap();
        let aggregator = Aggregator::new(AggregatorConfig::Sum {
            weighting: StudyWeighting::Uniform,
        });
        let transformer = SpatialKernelTransformer::new(
            &mask,
            KernelSettings::builder()
                .kernel(KernelConfig::Sphere {
                    radius_mm: 2.0,
                    density: SphereDensity::Uniform(1.0),
                })
                .build(),
        );
        let studies = vec![
            Study::coordinates("a", vec![Focus::new([4.0, 4.0, 4.0])]),
            Study::coordinates("b", vec![Focus::new([4.0, 4.0, 4.0]), Focus::new([6.0, 4.0, 4.0])]),
            Study::coordinates("c", vec![Focus::new([14.0, 14.0, 14.0])]),
        ];
        let set = StudySet::prepare(&transformer, &aggregator, &studies, None).unwrap();
        let stat = set.statistic(&aggregator).unwrap();
        let labels =
            label_clusters(&mask, stat.values.view(), 0.5, Tail::Upper, Connectivity::Faces);
        Fixture {
            mask,
            aggregator,
            set,
            labels,
        }
    }

    #[test]
    fn test_jackknife_single_study_cluster_is_fully_attributed() {
        let f = fixture();
        assert_eq!(f.labels.clusters.len(), 2);
        let table = Diagnostic::Jackknife
            .run(&f.mask, &f.aggregator, &f.set, &f.labels, Some(2))
            .unwrap();
        let lone = f.labels.labels[f.mask.position([7, 7, 7]).unwrap()];
        assert_relative_eq!(table.get("c", lone).unwrap(), 1.0);
        assert_relative_eq!(table.get("a", lone).unwrap(), 0.0);
    }

    #[test]
    fn test_jackknife_sum_contributions_add_to_one() {
        let f = fixture();
        let table = Diagnostic::Jackknife
            .run(&f.mask, &f.aggregator, &f.set, &f.labels, Some(2))
            .unwrap();
        for col in 0..table.cluster_ids.len() {
            assert_relative_eq!(table.values.column(col).sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_jackknife_independent_of_worker_count() {
        let f = fixture();
        let run = |n_workers| {
            Diagnostic::Jackknife
                .run(&f.mask, &f.aggregator, &f.set, &f.labels, Some(n_workers))
                .unwrap()
        };
        assert_eq!(run(1).values, run(3).values);
    }

    #[test]
    fn test_focus_counter_counts_foci_in_clusters() {
        let f = fixture();
        let table = Diagnostic::FocusCounter
            .run(&f.mask, &f.aggregator, &f.set, &f.labels, None)
            .unwrap();
        let shared = f.labels.labels[f.mask.position([2, 2, 2]).unwrap()];
        assert_eq!(table.get("b", shared), Some(2.0));
        assert_eq!(table.get("a", shared), Some(1.0));
        assert_eq!(table.get("c", shared), Some(0.0));
    }
}
