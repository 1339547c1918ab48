use tracing::{debug, info};

use crate::{
    aggregate::Aggregator,
    config::AnalysisConfig,
    correct::Corrector,
    diagnostics::{ContributionTable, Diagnostic},
    error::Result,
    kernel::SpatialKernelTransformer,
    mask::Mask,
    montecarlo::CancelToken,
    null::{NullDistributionEngine, StudySet},
    results::{GroupStatisticMap, MetaResult},
    study::{focus_filter, Study},
};

/// A configured coordinate- or image-based meta-analysis over one mask.
///
/// The configuration is validated once at construction, so invalid options
/// never reach the kernel, null or correction stages.
pub struct MetaAnalysis<'a> {
    mask: &'a Mask,
    config: AnalysisConfig,
}
impl<'a> MetaAnalysis<'a> {
    pub fn new(mask: &'a Mask, config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { mask, config })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn mask(&self) -> &'a Mask {
        self.mask
    }

    fn aggregator(&self) -> Aggregator {
        Aggregator::new(self.config.aggregator)
    }

    fn transformer(&self) -> SpatialKernelTransformer<'a> {
        SpatialKernelTransformer::new(self.mask, self.config.kernel.clone())
    }

    /// Observed group statistic only, without null estimation or correction.
    pub fn statistic(&self, studies: &[Study]) -> Result<GroupStatisticMap> {
        let aggregator = self.aggregator();
        StudySet::prepare(&self.transformer(), &aggregator, studies, None)?.statistic(&aggregator)
    }

    pub fn fit(&self, studies: &[Study]) -> Result<MetaResult> {
        self.fit_with(studies, None, &CancelToken::new())
    }

    /// Contrast of `target` against `reference` studies.
    pub fn fit_contrast(&self, target: &[Study], reference: &[Study]) -> Result<MetaResult> {
        self.fit_with(target, Some(reference), &CancelToken::new())
    }

    /// Full run, stoppable through `cancel` while resampling.
    pub fn fit_with(
        &self,
        target: &[Study],
        reference: Option<&[Study]>,
        cancel: &CancelToken,
    ) -> Result<MetaResult> {
        self.run(target, reference, cancel).map(|(_, result)| result)
    }

    fn run(
        &self,
        target: &[Study],
        reference: Option<&[Study]>,
        cancel: &CancelToken,
    ) -> Result<(StudySet, MetaResult)> {
        info!(n_studies = target.len(), "Performing meta-analysis...");
        let aggregator = self.aggregator();
        let studies = StudySet::prepare(&self.transformer(), &aggregator, target, reference)?;
        let statistic = studies.statistic(&aggregator)?;
        debug!(
            n_voxels = statistic.n_voxels(),
            max = statistic.max_magnitude(),
            "group statistic computed"
        );

        let null = NullDistributionEngine::new(self.mask, &self.config).estimate(&studies, cancel)?;
        let corrected =
            Corrector::new(self.config.correction.clone()).correct(self.mask, &statistic, &null)?;

        let result = MetaResult {
            study_ids: studies
                .target
                .maps
                .iter()
                .map(|m| m.study_id.clone())
                .collect(),
            statistic,
            null,
            corrected,
            modeled_activation: self
                .config
                .keep_modeled_activation
                .then(|| studies.target.maps.clone()),
        };
        Ok((studies, result))
    }
}

/// Output of [`cbma_workflow`].
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub result: MetaResult,
    /// Number of foci removed for lying outside the mask.
    pub dropped_foci: usize,
    pub diagnostics: Vec<ContributionTable>,
}

/// Filters foci to the mask, runs the meta-analysis and applies each
/// diagnostic to the significant clusters of the corrected map.
pub fn cbma_workflow(
    mask: &Mask,
    studies: &[Study],
    config: AnalysisConfig,
    diagnostics: &[Diagnostic],
) -> Result<WorkflowResult> {
    let analysis = MetaAnalysis::new(mask, config)?;
    let (studies, dropped_foci) = focus_filter(mask, studies);
    let (set, result) = analysis.run(&studies, None, &CancelToken::new())?;

    let labels = result.corrected.significant_clusters(
        mask,
        &result.statistic,
        analysis.config().correction.connectivity,
    );
    let aggregator = analysis.aggregator();
    let n_workers = analysis
        .config()
        .monte_carlo
        .as_ref()
        .and_then(|monte_carlo| monte_carlo.n_workers);
    let tables = if labels.is_empty() {
        Vec::new()
    } else {
        diagnostics
            .iter()
            .map(|diagnostic| diagnostic.run(mask, &aggregator, &set, &labels, n_workers))
            .collect::<Result<Vec<_>>>()?
    };
    info!("Workflow completed.");

    Ok(WorkflowResult {
        result,
        dropped_foci,
        diagnostics: tables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{
            AggregatorConfig, CorrectionConfig, CorrectionMethod, KernelConfig, KernelSettings,
            SphereDensity, StudyWeighting,
        },
        error::MetaError,
        mask::Affine,
        study::Focus,
    };
    use approx::assert_relative_eq;

    fn mask() -> Mask {
        Mask::full([8, 8, 8], Affine::isotropic(2.0, [0.0; 3]).unwrap()).unwrap()
    }

    fn config(keep: bool) -> AnalysisConfig {
        AnalysisConfig::builder()
            .kernel(
                KernelSettings::builder()
                    .kernel(KernelConfig::Sphere {
                        radius_mm: 2.0,
                        density: SphereDensity::Uniform(1.0),
                    })
                    .build(),
            )
            .aggregator(AggregatorConfig::Sum {
                weighting: StudyWeighting::Uniform,
            })
            .correction(
                CorrectionConfig::builder()
                    .method(CorrectionMethod::Bonferroni)
                    .build(),
            )
            .keep_modeled_activation(keep)
            .build()
    }

    fn studies() -> Vec<Study> {
        (0..6)
            .map(|i| {
                Study::coordinates(
                    format!("s{i}"),
                    vec![Focus::new([6.0, 6.0, 6.0]), Focus::new([2.0 * i as f64, 0.0, 12.0])],
                )
            })
            .collect()
    }

    #[test]
    fn test_fit_keeps_modeled_activation_on_request() {
        let mask = mask();
        let kept = MetaAnalysis::new(&mask, config(true))
            .unwrap()
            .fit(&studies())
            .unwrap();
        assert_eq!(kept.modeled_activation.map(|m| m.len()), Some(6));
        assert_eq!(kept.study_ids.len(), 6);

        let dropped = MetaAnalysis::new(&mask, config(false))
            .unwrap()
            .fit(&studies())
            .unwrap();
        assert!(dropped.modeled_activation.is_none());
    }

    #[test]
    fn test_zero_studies_rejected() {
        let mask = mask();
        let analysis = MetaAnalysis::new(&mask, config(false)).unwrap();
        assert!(matches!(
            analysis.fit(&[]),
            Err(MetaError::InputData { .. })
        ));
    }

    #[test]
    fn test_workflow_filters_foci_and_runs_diagnostics() {
        let mask = mask();
        let mut studies = studies();
        studies[0] = Study::coordinates(
            "s0",
            vec![Focus::new([6.0, 6.0, 6.0]), Focus::new([100.0, 0.0, 0.0])],
        );
        let output = cbma_workflow(
            &mask,
            &studies,
            config(false),
            &[Diagnostic::Jackknife, Diagnostic::FocusCounter],
        )
        .unwrap();
        assert_eq!(output.dropped_foci, 1);

        // only the focus shared by all six studies survives correction
        assert_eq!(output.result.corrected.clusters.len(), 1);
        assert_eq!(output.diagnostics.len(), 2);
        let (jackknife, counter) = (&output.diagnostics[0], &output.diagnostics[1]);
        assert_eq!(jackknife.diagnostic, Diagnostic::Jackknife);
        assert_eq!(jackknife.cluster_ids, vec![1]);
        for id in ["s0", "s1", "s2", "s3", "s4", "s5"] {
            assert_relative_eq!(jackknife.get(id, 1).unwrap(), 1.0 / 6.0, epsilon = 1e-12);
            assert_eq!(counter.get(id, 1), Some(1.0));
        }
    }
}
