use std::sync::Arc;

use ndarray::Array1;
use tracing::warn;

use crate::{
    config::{
        FociCombine, KernelConfig, KernelSettings, KernelWidth, MapRule, OutOfBoundsPolicy,
        SphereDensity,
    },
    error::{MetaError, Result},
    mask::Mask,
    math::{ale_fwhm, fwhm_to_sigma},
    study::{Focus, Study, StudyData},
};

/// A study's dense modeled activation over the mask voxels.
#[derive(Debug, Clone)]
pub struct ModeledActivationMap {
    pub study_id: String,
    pub sample_size: Option<usize>,
    pub values: Array1<f64>,
}

/// Kernel values at voxel offsets from a focus.
#[derive(Debug, Clone)]
pub struct Stencil {
    offsets: Vec<([i64; 3], f64)>,
}
impl Stencil {
    fn gaussian(fwhm_mm: f64, voxel_sizes: [f64; 3]) -> Self {
        let sigma = voxel_sizes.map(|size| fwhm_to_sigma(fwhm_mm) / size);
        let half = sigma.map(|s| (4.0 * s).ceil() as i64);

        let mut offsets = Vec::new();
        for di in -half[0]..=half[0] {
            for dj in -half[1]..=half[1] {
                for dk in -half[2]..=half[2] {
                    let exponent = (di as f64 / sigma[0]).powi(2)
                        + (dj as f64 / sigma[1]).powi(2)
                        + (dk as f64 / sigma[2]).powi(2);
                    offsets.push(([di, dj, dk], (-0.5 * exponent).exp()));
                }
            }
        }
        let total = offsets.iter().map(|(_, v)| v).sum::<f64>();
        offsets.iter_mut().for_each(|(_, v)| *v /= total);

        Self { offsets }
    }

    fn sphere(radius_mm: f64, density: SphereDensity, voxel_sizes: [f64; 3]) -> Self {
        let half = voxel_sizes.map(|size| (radius_mm / size).floor() as i64);

        let mut offsets = Vec::new();
        for di in -half[0]..=half[0] {
            for dj in -half[1]..=half[1] {
                for dk in -half[2]..=half[2] {
                    let distance = ((di as f64 * voxel_sizes[0]).powi(2)
                        + (dj as f64 * voxel_sizes[1]).powi(2)
                        + (dk as f64 * voxel_sizes[2]).powi(2))
                    .sqrt();
                    if distance > radius_mm {
                        continue;
                    }
                    let value = match density {
                        SphereDensity::Uniform(value) => value,
                        SphereDensity::Linear => 1.0 - distance / radius_mm,
                    };
                    if value > 0.0 {
                        offsets.push(([di, dj, dk], value));
                    }
                }
            }
        }

        Self { offsets }
    }
}

/// A study resolved against the mask, ready to be rendered repeatedly.
#[derive(Debug, Clone)]
pub enum PreparedStudy {
    Coordinates {
        id: String,
        sample_size: Option<usize>,
        foci: Vec<[i64; 3]>,
        weights: Vec<f64>,
        stencil: Arc<Stencil>,
        combine: FociCombine,
    },
    Map {
        id: String,
        sample_size: Option<usize>,
        values: Array1<f64>,
    },
}
impl PreparedStudy {
    pub fn id(&self) -> &str {
        match self {
            PreparedStudy::Coordinates { id, .. } | PreparedStudy::Map { id, .. } => id,
        }
    }

    pub fn sample_size(&self) -> Option<usize> {
        match self {
            PreparedStudy::Coordinates { sample_size, .. }
            | PreparedStudy::Map { sample_size, .. } => *sample_size,
        }
    }

    /// Voxel indices of the study's foci; empty for map studies.
    pub fn foci(&self) -> &[[i64; 3]] {
        match self {
            PreparedStudy::Coordinates { foci, .. } => foci,
            PreparedStudy::Map { .. } => &[],
        }
    }

    /// Renders the study at its own foci.
    pub fn render(&self, mask: &Mask) -> ModeledActivationMap {
        let values = match self {
            PreparedStudy::Coordinates { foci, .. } => self.render_values(mask, foci),
            PreparedStudy::Map { values, .. } => values.clone(),
        };
        ModeledActivationMap {
            study_id: self.id().to_string(),
            sample_size: self.sample_size(),
            values,
        }
    }

    /// Renders the study's kernel at substitute focus positions.
    ///
    /// Map studies ignore `foci` and return their own values.
    pub fn render_values(&self, mask: &Mask, foci: &[[i64; 3]]) -> Array1<f64> {
        match self {
            PreparedStudy::Coordinates {
                weights,
                stencil,
                combine,
                ..
            } => render_foci(mask, stencil, foci, weights, *combine),
            PreparedStudy::Map { values, .. } => values.clone(),
        }
    }
}

fn render_foci(
    mask: &Mask,
    stencil: &Stencil,
    foci: &[[i64; 3]],
    weights: &[f64],
    combine: FociCombine,
) -> Array1<f64> {
    let mut values = Array1::<f64>::zeros(mask.n_voxels());
    for (center, weight) in foci.iter().zip(weights.iter()) {
        for (offset, kernel) in stencil.offsets.iter() {
            let ijk = [
                center[0] + offset[0],
                center[1] + offset[1],
                center[2] + offset[2],
            ];
            if let Some(position) = mask.position(ijk) {
                let value = kernel * weight;
                match combine {
                    FociCombine::Max => {
                        if value > values[position] {
                            values[position] = value;
                        }
                    }
                    FociCombine::Sum => values[position] += value,
                }
            }
        }
    }
    values
}

/// Converts studies into modeled activation maps over a mask.
pub struct SpatialKernelTransformer<'a> {
    mask: &'a Mask,
    settings: KernelSettings,
}
impl<'a> SpatialKernelTransformer<'a> {
    pub fn new(mask: &'a Mask, settings: KernelSettings) -> Self {
        Self { mask, settings }
    }

    pub fn mask(&self) -> &'a Mask {
        self.mask
    }

    pub fn settings(&self) -> &KernelSettings {
        &self.settings
    }

    pub fn transform(&self, study: &Study) -> Result<ModeledActivationMap> {
        Ok(self.prepare(study)?.render(self.mask))
    }

    /// Resolves a study's foci to voxels and builds its kernel.
    pub fn prepare(&self, study: &Study) -> Result<PreparedStudy> {
        match &study.data {
            StudyData::Coordinates(foci) => self.prepare_coordinates(study, foci),
            StudyData::Map(values) => self.prepare_map(study, values),
        }
    }

    pub fn prepare_all(&self, studies: &[Study]) -> Result<Vec<PreparedStudy>> {
        studies.iter().map(|study| self.prepare(study)).collect()
    }

    fn prepare_coordinates(&self, study: &Study, foci: &[Focus]) -> Result<PreparedStudy> {
        let mut voxels = Vec::with_capacity(foci.len());
        let mut weights = Vec::with_capacity(foci.len());
        for (index, focus) in foci.iter().enumerate() {
            if !focus.weight.is_finite() || focus.weight <= 0.0 {
                return Err(MetaError::input(
                    &study.id,
                    format!("focus {index} has non-positive weight {}", focus.weight),
                ));
            }
            if focus.xyz.iter().any(|c| !c.is_finite()) {
                return Err(MetaError::input(
                    &study.id,
                    format!("focus {index} has a non-finite coordinate"),
                ));
            }
            let ijk = self.mask.world_to_voxel(focus.xyz);
            if !self.mask.in_bounds(ijk) {
                match self.settings.out_of_bounds {
                    OutOfBoundsPolicy::Reject => {
                        return Err(MetaError::input(
                            &study.id,
                            format!("focus {index} at {:?} lies outside the mask grid", focus.xyz),
                        ))
                    }
                    OutOfBoundsPolicy::Drop => {
                        warn!(
                            study = %study.id,
                            focus = index,
                            "dropping focus outside the mask grid"
                        );
                        continue;
                    }
                }
            }
            voxels.push(ijk);
            weights.push(focus.weight);
        }
        if voxels.is_empty() {
            return Err(MetaError::input(&study.id, "study has no valid coordinates"));
        }

        let voxel_sizes = self.mask.voxel_sizes();
        let stencil = match self.settings.kernel {
            KernelConfig::Gaussian { fwhm } => {
                let fwhm = match fwhm {
                    KernelWidth::Fixed(fwhm) => fwhm,
                    KernelWidth::SampleSize => {
                        let n = study.sample_size.filter(|n| *n > 0).ok_or_else(|| {
                            MetaError::input(
                                &study.id,
                                "a sample-size dependent kernel needs a positive sample size",
                            )
                        })?;
                        ale_fwhm(n)
                    }
                };
                Stencil::gaussian(fwhm, voxel_sizes)
            }
            KernelConfig::Sphere { radius_mm, density } => {
                Stencil::sphere(radius_mm, density, voxel_sizes)
            }
        };

        Ok(PreparedStudy::Coordinates {
            id: study.id.clone(),
            sample_size: study.sample_size,
            foci: voxels,
            weights,
            stencil: Arc::new(stencil),
            combine: self.settings.combine,
        })
    }

    fn prepare_map(&self, study: &Study, values: &[f64]) -> Result<PreparedStudy> {
        if values.len() != self.mask.n_voxels() {
            return Err(MetaError::input(
                &study.id,
                format!(
                    "statistical map has {} values but the mask has {} voxels",
                    values.len(),
                    self.mask.n_voxels()
                ),
            ));
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(MetaError::input(
                &study.id,
                format!("statistical map is non-finite at voxel {index}"),
            ));
        }
        let values = values
            .iter()
            .map(|v| match self.settings.map_rule {
                MapRule::Binarize { threshold } => {
                    if *v > threshold {
                        1.0
                    } else {
                        0.0
                    }
                }
                MapRule::Threshold { threshold } => {
                    if *v > threshold {
                        *v
                    } else {
                        0.0
                    }
                }
                MapRule::Identity => *v,
            })
            .collect::<Array1<f64>>();
        Ok(PreparedStudy::Map {
            id: study.id.clone(),
            sample_size: study.sample_size,
            values,
        })
    }
}
