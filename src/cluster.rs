use std::collections::VecDeque;

use derive_new::new;
use ndarray::ArrayView1;

use crate::{config::Connectivity, mask::Mask, results::Tail};

/// A connected set of supra-threshold voxels sharing one sign.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// +1 for positive clusters, -1 for negative ones.
    pub sign: f64,
    /// Mask positions, in discovery order.
    pub voxels: Vec<usize>,
}
impl Cluster {
    pub fn size(&self) -> usize {
        self.voxels.len()
    }

    pub fn mass(&self, values: ArrayView1<f64>) -> f64 {
        self.voxels.iter().map(|v| values[*v].abs()).sum()
    }
}

/// Connected components of a thresholded map.
#[derive(Debug, Clone)]
pub struct ClusterLabels {
    /// 0 for sub-threshold voxels, otherwise the 1-based cluster id.
    pub labels: Vec<usize>,
    pub clusters: Vec<Cluster>,
}
impl ClusterLabels {
    pub fn max_size(&self) -> usize {
        self.clusters.iter().map(Cluster::size).max().unwrap_or(0)
    }

    pub fn max_mass(&self, values: ArrayView1<f64>) -> f64 {
        self.clusters
            .iter()
            .map(|c| c.mass(values))
            .fold(0.0, f64::max)
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Labels voxels whose statistic magnitude reaches `threshold`.
///
/// For two-sided maps positive and negative voxels never join the same cluster.
pub fn label_clusters(
    mask: &Mask,
    values: ArrayView1<f64>,
    threshold: f64,
    tail: Tail,
    connectivity: Connectivity,
) -> ClusterLabels {
    let sign_of = |v: f64| -> Option<f64> {
        match tail {
            Tail::Upper if v >= threshold => Some(1.0),
            Tail::TwoSided if v.abs() >= threshold && v != 0.0 => Some(v.signum()),
            _ => None,
        }
    };
    label_by(mask, values.len(), |p| sign_of(values[p]), connectivity)
}

/// Labels voxels flagged in `include`, splitting clusters by the sign of `values`.
pub fn label_significant(
    mask: &Mask,
    values: ArrayView1<f64>,
    include: &[bool],
    connectivity: Connectivity,
) -> ClusterLabels {
    label_by(
        mask,
        include.len(),
        |p| include[p].then(|| if values[p] < 0.0 { -1.0 } else { 1.0 }),
        connectivity,
    )
}

fn label_by(
    mask: &Mask,
    n_voxels: usize,
    sign_of: impl Fn(usize) -> Option<f64>,
    connectivity: Connectivity,
) -> ClusterLabels {
    let offsets = connectivity.offsets();
    let mut labels = vec![0; n_voxels];
    let mut clusters = Vec::new();
    let mut queue = VecDeque::new();

    for seed in 0..n_voxels {
        if labels[seed] != 0 {
            continue;
        }
        let Some(sign) = sign_of(seed) else {
            continue;
        };

        let id = clusters.len() + 1;
        let mut voxels = vec![seed];
        labels[seed] = id;
        queue.push_back(seed);
        while let Some(current) = queue.pop_front() {
            let ijk = mask.ijk(current);
            for offset in offsets.iter() {
                let neighbour = [
                    ijk[0] as i64 + offset[0],
                    ijk[1] as i64 + offset[1],
                    ijk[2] as i64 + offset[2],
                ];
                let Some(position) = mask.position(neighbour) else {
                    continue;
                };
                if labels[position] == 0 && sign_of(position) == Some(sign) {
                    labels[position] = id;
                    voxels.push(position);
                    queue.push_back(position);
                }
            }
        }
        clusters.push(Cluster { sign, voxels });
    }

    ClusterLabels { labels, clusters }
}

/// Summary row of one cluster.
#[derive(new, Debug, Clone, PartialEq)]
pub struct ClusterReport {
    pub id: usize,
    pub sign: f64,
    pub size: usize,
    pub volume_mm3: f64,
    pub mass: f64,
    pub peak_stat: f64,
    pub peak_ijk: [usize; 3],
    pub peak_xyz: [f64; 3],
    pub center_of_mass_xyz: [f64; 3],
}

/// Builds the cluster table of a labelled map.
pub fn cluster_table(
    mask: &Mask,
    values: ArrayView1<f64>,
    labels: &ClusterLabels,
) -> Vec<ClusterReport> {
    labels
        .clusters
        .iter()
        .enumerate()
        .map(|(index, cluster)| {
            let peak = cluster
                .voxels
                .iter()
                .copied()
                .max_by(|a, b| values[*a].abs().total_cmp(&values[*b].abs()))
                .unwrap_or(cluster.voxels[0]);
            let mut center = [0.0; 3];
            for voxel in cluster.voxels.iter() {
                let xyz = mask.voxel_to_world(mask.ijk(*voxel));
                for axis in 0..3 {
                    center[axis] += xyz[axis];
                }
            }
            let center = center.map(|c| c / cluster.size() as f64);
            ClusterReport::new(
                index + 1,
                cluster.sign,
                cluster.size(),
                cluster.size() as f64 * mask.voxel_volume_mm3(),
                cluster.mass(values),
                values[peak],
                mask.ijk(peak),
                mask.voxel_to_world(mask.ijk(peak)),
                center,
            )
        })
        .collect()
}

/// Prints a cluster table as tab-separated values.
pub fn pprint_clusters(table: &[ClusterReport]) {
    println!("Cluster ID\tSign\tSize\tVolume (mm3)\tMass\tPeak Stat\tX\tY\tZ");
    for row in table {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.id,
            row.sign,
            row.size,
            row.volume_mm3,
            row.mass,
            row.peak_stat,
            row.peak_xyz[0],
            row.peak_xyz[1],
            row.peak_xyz[2],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Affine;
    use approx::assert_relative_eq;
    use ndarray::Array1;

    fn mask() -> Mask {
        Mask::full([4, 4, 4], Affine::isotropic(2.0, [0.0; 3]).unwrap()).unwrap()
    }

    fn map_with(mask: &Mask, voxels: &[([i64; 3], f64)]) -> Array1<f64> {
        let mut values = Array1::zeros(mask.n_voxels());
        for (ijk, v) in voxels {
            values[mask.position(*ijk).unwrap()] = *v;
        }
        values
    }

    #[test]
    fn test_connectivity_changes_cluster_count() {
        let mask = mask();
        // diagonal neighbours: share an edge only
        let values = map_with(&mask, &[([0, 0, 0], 3.0), ([1, 1, 0], 3.0), ([3, 3, 3], 4.0)]);
        let faces = label_clusters(&mask, values.view(), 1.0, Tail::Upper, Connectivity::Faces);
        let edges =
            label_clusters(&mask, values.view(), 1.0, Tail::Upper, Connectivity::FacesEdges);
        assert_eq!(faces.clusters.len(), 3);
        assert_eq!(edges.clusters.len(), 2);
        assert_eq!(edges.max_size(), 2);
    }

    #[test]
    fn test_corner_adjacency_needs_26_neighbourhood() {
        let mask = mask();
        let values = map_with(&mask, &[([0, 0, 0], 3.0), ([1, 1, 1], 3.0)]);
        let edges =
            label_clusters(&mask, values.view(), 1.0, Tail::Upper, Connectivity::FacesEdges);
        let corners = label_clusters(
            &mask,
            values.view(),
            1.0,
            Tail::Upper,
            Connectivity::FacesEdgesCorners,
        );
        assert_eq!(edges.clusters.len(), 2);
        assert_eq!(corners.clusters.len(), 1);
    }

    #[test]
    fn test_two_sided_clusters_split_by_sign() {
        let mask = mask();
        let values = map_with(&mask, &[([0, 0, 0], 3.0), ([0, 0, 1], -3.0), ([0, 0, 2], -2.0)]);
        let labels = label_clusters(&mask, values.view(), 1.0, Tail::TwoSided, Connectivity::Faces);
        assert_eq!(labels.clusters.len(), 2);
        assert_eq!(labels.clusters[1].sign, -1.0);
        assert_relative_eq!(labels.max_mass(values.view()), 5.0);
    }

    #[test]
    fn test_significant_voxels_split_by_sign() {
        let mask = mask();
        let values = map_with(&mask, &[([0, 0, 0], 3.0), ([0, 0, 1], -3.0), ([0, 0, 2], -2.0)]);
        let include = values.iter().map(|v| *v != 0.0).collect::<Vec<_>>();
        let labels = label_significant(&mask, values.view(), &include, Connectivity::Faces);
        assert_eq!(labels.clusters.len(), 2);
        assert_eq!(labels.clusters[1].size(), 2);
    }

    #[test]
    fn test_cluster_table_peak_and_center() {
        let mask = mask();
        let values = map_with(&mask, &[([1, 1, 1], 2.0), ([1, 1, 2], 5.0)]);
        let labels = label_clusters(&mask, values.view(), 1.0, Tail::Upper, Connectivity::Faces);
        let table = cluster_table(&mask, values.view(), &labels);
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].peak_ijk, [1, 1, 2]);
        assert_eq!(table[0].peak_xyz, [2.0, 2.0, 4.0]);
        assert_relative_eq!(table[0].center_of_mass_xyz[2], 3.0);
        assert_relative_eq!(table[0].volume_mm3, 16.0);
    }
}
