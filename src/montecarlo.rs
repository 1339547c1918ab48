use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use ndarray::Array1;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::debug;

use crate::{
    aggregate::Aggregator,
    cluster::label_clusters,
    config::{AggregatorConfig, Connectivity, DrawMode, MonteCarloConfig},
    error::{MetaError, Result},
    histogram::bin_index,
    kernel::{ModeledActivationMap, PreparedStudy},
    mask::Mask,
    null::StudySet,
};

/// Shared flag for stopping a long-running resampling pass early.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Rayon pool with `n_workers` threads, or rayon's default size.
pub(crate) fn worker_pool(n_workers: Option<usize>) -> Result<rayon::ThreadPool> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n_workers) = n_workers {
        builder = builder.num_threads(n_workers);
    }
    Ok(builder.build()?)
}

/// What each draw has to report back.
#[derive(Debug, Clone, Default)]
pub(crate) struct DrawRequest {
    pub cluster_threshold: Option<f64>,
    pub pooled_bin_width: Option<f64>,
    pub per_voxel: bool,
}

/// Reduced result of a single Monte-Carlo draw.
#[derive(Debug, Clone)]
pub(crate) struct DrawSummary {
    pub max_stat: f64,
    pub max_cluster_size: usize,
    pub max_cluster_mass: f64,
    pub counts: Option<BTreeMap<usize, u64>>,
    pub values: Option<Array1<f64>>,
}

/// Generates null statistic maps by redrawing study inputs.
///
/// Draw `i` always uses the ChaCha8 stream `i` of the configured seed, so
/// every draw is reproducible in isolation and independent of scheduling.
pub(crate) struct MonteCarlo<'a> {
    mask: &'a Mask,
    aggregator: Aggregator,
    studies: &'a StudySet,
    config: &'a MonteCarloConfig,
    connectivity: Connectivity,
}
impl<'a> MonteCarlo<'a> {
    pub fn new(
        mask: &'a Mask,
        aggregator: Aggregator,
        studies: &'a StudySet,
        config: &'a MonteCarloConfig,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            mask,
            aggregator,
            studies,
            config,
            connectivity,
        }
    }

    /// Runs every draw on a bounded worker pool and returns the summaries in
    /// draw order.
    ///
    /// An expired timeout stops this run only; `cancel` is never modified.
    pub fn run(&self, request: &DrawRequest, cancel: &CancelToken) -> Result<Vec<DrawSummary>> {
        let pool = worker_pool(self.config.n_workers)?;

        let requested = self.config.n_resamples;
        let deadline = self.config.timeout.map(|timeout| Instant::now() + timeout);
        let expired = AtomicBool::new(false);
        let completed = AtomicUsize::new(0);
        debug!(
            n_resamples = requested,
            workers = pool.current_num_threads(),
            "starting Monte-Carlo draws"
        );

        pool.install(|| {
            (0..requested)
                .into_par_iter()
                .map(|index| {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        expired.store(true, Ordering::SeqCst);
                    }
                    if expired.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        return Err(MetaError::Cancelled {
                            completed: completed.load(Ordering::SeqCst),
                            requested,
                        });
                    }
                    let map = self.draw(index);
                    let summary = self.summarize(map, request);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(summary)
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    /// Null statistic map of draw `index`.
    pub fn draw(&self, index: usize) -> Array1<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        rng.set_stream(index as u64);

        match (&self.studies.reference, self.aggregator.config()) {
            (Some(reference), AggregatorConfig::Specificity) => {
                self.permute_labels(&reference.maps, &mut rng)
            }
            _ => self.redraw_target(&mut rng),
        }
    }

    /// Shuffles study membership between the target and reference groups.
    fn permute_labels(
        &self,
        reference: &[ModeledActivationMap],
        rng: &mut ChaCha8Rng,
    ) -> Array1<f64> {
        let pooled = self
            .studies
            .target
            .maps
            .iter()
            .chain(reference.iter())
            .map(|m| &m.values)
            .collect::<Vec<_>>();
        let mut order = (0..pooled.len()).collect::<Vec<_>>();
        order.shuffle(rng);
        let n_target = self.studies.target.maps.len();
        let target = order[..n_target].iter().map(|i| pooled[*i]).collect::<Vec<_>>();
        let shuffled_reference = order[n_target..].iter().map(|i| pooled[*i]).collect::<Vec<_>>();
        let weights = vec![1.0; n_target];
        self.aggregator
            .statistic(&target, &weights, Some(&shuffled_reference))
    }

    /// Re-renders every target study at random positions.
    fn redraw_target(&self, rng: &mut ChaCha8Rng) -> Array1<f64> {
        let prepared = &self.studies.target.prepared;
        let foci = match self.config.draw {
            DrawMode::Uniform => prepared
                .iter()
                .map(|study| {
                    (0..study.foci().len())
                        .map(|_| {
                            let voxel = self.mask.ijk(rng.gen_range(0..self.mask.n_voxels()));
                            voxel.map(|c| c as i64)
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>(),
            DrawMode::Permute => {
                let mut pool = prepared
                    .iter()
                    .flat_map(|study| study.foci().iter().copied())
                    .collect::<Vec<_>>();
                pool.shuffle(rng);
                let mut start = 0;
                prepared
                    .iter()
                    .map(|study| {
                        let end = start + study.foci().len();
                        let chunk = pool[start..end].to_vec();
                        start = end;
                        chunk
                    })
                    .collect::<Vec<_>>()
            }
        };

        let maps = prepared
            .iter()
            .zip(foci.iter())
            .map(|(study, foci)| match study {
                PreparedStudy::Coordinates { .. } => study.render_values(self.mask, foci),
                PreparedStudy::Map { values, .. } => {
                    let mut shuffled = values.to_vec();
                    shuffled.shuffle(rng);
                    Array1::from(shuffled)
                }
            })
            .collect::<Vec<_>>();
        let refs = maps.iter().collect::<Vec<_>>();
        self.aggregator
            .statistic(&refs, &self.studies.target.weights, None)
    }

    fn summarize(&self, map: Array1<f64>, request: &DrawRequest) -> DrawSummary {
        let tail = self.aggregator.tail();
        let magnitudes = map.mapv(|v| tail.magnitude(v));
        let max_stat = magnitudes.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let (max_cluster_size, max_cluster_mass) = match request.cluster_threshold {
            Some(threshold) => {
                let labels =
                    label_clusters(self.mask, map.view(), threshold, tail, self.connectivity);
                (labels.max_size(), labels.max_mass(map.view()))
            }
            None => (0, 0.0),
        };

        let counts = request.pooled_bin_width.map(|bin_width| {
            let mut counts = BTreeMap::new();
            for value in magnitudes.iter() {
                *counts.entry(bin_index(*value, bin_width)).or_default() += 1;
            }
            counts
        });

        DrawSummary {
            max_stat,
            max_cluster_size,
            max_cluster_mass,
            counts,
            values: request.per_voxel.then_some(magnitudes),
        }
    }
}
