use derive_new::new;
use tracing::info;

use crate::mask::Mask;

/// A single reported activation coordinate in world space (mm).
#[derive(new, Debug, Clone, Copy, PartialEq)]
pub struct Focus {
    pub xyz: [f64; 3],
    #[new(value = "1.0")]
    pub weight: f64,
}
impl Focus {
    pub fn weighted(xyz: [f64; 3], weight: f64) -> Self {
        Self { xyz, weight }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StudyData {
    /// Sparse peak coordinates.
    Coordinates(Vec<Focus>),
    /// A statistical map already sampled on the mask voxels.
    Map(Vec<f64>),
}

/// One meta-analysis input unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Study {
    pub id: String,
    pub sample_size: Option<usize>,
    pub data: StudyData,
    /// Study-level covariates for meta-regression.
    pub covariates: Vec<f64>,
}
impl Study {
    pub fn coordinates(id: impl Into<String>, foci: Vec<Focus>) -> Self {
        Self {
            id: id.into(),
            sample_size: None,
            data: StudyData::Coordinates(foci),
            covariates: Vec::new(),
        }
    }

    pub fn map(id: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            sample_size: None,
            data: StudyData::Map(values),
            covariates: Vec::new(),
        }
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = Some(sample_size);
        self
    }

    pub fn with_covariates(mut self, covariates: Vec<f64>) -> Self {
        self.covariates = covariates;
        self
    }

    pub fn foci(&self) -> Option<&[Focus]> {
        match &self.data {
            StudyData::Coordinates(foci) => Some(foci),
            StudyData::Map(_) => None,
        }
    }
}

/// Removes every focus whose nearest voxel is not in the mask.
///
/// Studies left without foci are kept; map studies are passed through untouched.
/// Returns the filtered studies and the number of removed foci.
pub fn focus_filter(mask: &Mask, studies: &[Study]) -> (Vec<Study>, usize) {
    let mut removed = 0;
    let mut total = 0;
    let filtered = studies
        .iter()
        .map(|study| match &study.data {
            StudyData::Coordinates(foci) => {
                total += foci.len();
                let kept = foci
                    .iter()
                    .copied()
                    .filter(|focus| mask.position(mask.world_to_voxel(focus.xyz)).is_some())
                    .collect::<Vec<_>>();
                removed += foci.len() - kept.len();
                Study {
                    data: StudyData::Coordinates(kept),
                    ..study.clone()
                }
            }
            StudyData::Map(_) => study.clone(),
        })
        .collect::<Vec<_>>();
    info!("{removed}/{total} coordinates fall outside of the mask, removing them");
    (filtered, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Affine;

    #[test]
    fn test_focus_default_weight() {
        let focus = Focus::new([1.0, 2.0, 3.0]);
        assert_eq!(focus.weight, 1.0);
    }

    #[test]
    fn test_focus_filter_drops_outside_mask() {
        let mut data = vec![true; 27];
        data[26] = false;
        let mask = Mask::new([3, 3, 3], &data, Affine::identity()).unwrap();
        let studies = vec![
            Study::coordinates(
                "a",
                vec![
                    Focus::new([0.0, 0.0, 0.0]),
                    Focus::new([2.0, 2.0, 2.0]),
                    Focus::new([9.0, 0.0, 0.0]),
                ],
            ),
            Study::map("b", vec![0.0; 26]),
        ];
        let (filtered, removed) = focus_filter(&mask, &studies);
        assert_eq!(removed, 2);
        assert_eq!(filtered[0].foci().unwrap().len(), 1);
        assert_eq!(filtered[1], studies[1]);
    }
}
