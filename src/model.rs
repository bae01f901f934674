//! Customer segmentation with K-Means and DBSCAN
//!
//! Both algorithms run over the same standardised feature matrix. Each result
//! carries its own quality scores; profiles are reported in raw feature units.

use crate::config::AnalyticsConfig;
use crate::data::SegmentRow;
use crate::features::{feature_matrix, CustomerFeatureVector, SEGMENT_FEATURES};
use crate::scaler::StandardScaler;
use linfa::prelude::*;
use linfa::ParamGuard;
use linfa_clustering::{Dbscan, KMeans};
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Cluster id persisted for DBSCAN noise points
pub const NOISE_CLUSTER_ID: i64 = -1;

/// Clustering algorithm that produced a label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    KMeans,
    Dbscan,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::KMeans => write!(f, "KMeans"),
            Algorithm::Dbscan => write!(f, "DBSCAN"),
        }
    }
}

/// Label assigned to one customer
///
/// Ids are opaque: they are stable within a run but carry no ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterLabel {
    Cluster(usize),
    Noise,
}

impl ClusterLabel {
    /// Integer id as written to the store
    pub fn id(&self) -> i64 {
        match self {
            ClusterLabel::Cluster(id) => *id as i64,
            ClusterLabel::Noise => NOISE_CLUSTER_ID,
        }
    }

    /// Human-readable segment name, e.g. `KMeans_Segment_2`
    pub fn segment_name(&self, algorithm: Algorithm) -> String {
        match self {
            ClusterLabel::Cluster(id) => format!("{}_Segment_{}", algorithm, id),
            ClusterLabel::Noise => "Noise".to_string(),
        }
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterLabel::Cluster(id) => write!(f, "Cluster {}", id),
            ClusterLabel::Noise => write!(f, "Noise"),
        }
    }
}

/// Cluster quality metrics
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClusterScores {
    /// Mean silhouette coefficient in [-1, 1]
    pub silhouette: f64,
    /// Calinski-Harabasz variance ratio
    pub calinski_harabasz: f64,
    /// Set when fewer than two clusters (or points) made scoring meaningless
    pub degenerate: bool,
}

impl ClusterScores {
    fn degenerate() -> Self {
        Self {
            degenerate: true,
            ..Self::default()
        }
    }
}

/// Result of one clustering algorithm
#[derive(Debug, Clone)]
pub struct Clustering {
    pub algorithm: Algorithm,
    /// One label per matrix row
    pub labels: Vec<ClusterLabel>,
    /// Number of distinct non-noise clusters
    pub n_clusters: usize,
    pub scores: ClusterScores,
    /// Within-cluster sum of squares (K-Means only)
    pub inertia: Option<f64>,
}

impl Clustering {
    /// Member count per label, noise last
    pub fn cluster_sizes(&self) -> BTreeMap<ClusterLabel, usize> {
        let mut sizes = BTreeMap::new();
        for label in &self.labels {
            *sizes.entry(*label).or_insert(0) += 1;
        }
        sizes
    }

    pub fn noise_count(&self) -> usize {
        self.labels
            .iter()
            .filter(|l| **l == ClusterLabel::Noise)
            .count()
    }
}

/// Fit K-Means on a standardised matrix
///
/// Every row receives a label in `[0, k)`. When the matrix has fewer
/// distinct rows than `k`, only that many clusters are formed.
pub fn fit_kmeans(matrix: &Array2<f64>, config: &AnalyticsConfig) -> crate::Result<Clustering> {
    let n_samples = matrix.nrows();
    if n_samples == 0 {
        anyhow::bail!("Cannot cluster an empty feature matrix");
    }

    let distinct = count_distinct_rows(matrix);
    let k = config.n_clusters.min(distinct);
    if k < config.n_clusters {
        warn!(
            requested = config.n_clusters,
            used = k,
            "Fewer distinct customers than requested clusters"
        );
    }

    let assignments: Array1<usize> = if k <= 1 {
        Array1::zeros(n_samples)
    } else {
        // Dummy targets for unsupervised learning
        let dataset = Dataset::new(matrix.clone(), Array1::<usize>::zeros(n_samples));
        let rng = StdRng::seed_from_u64(config.seed);
        let model = KMeans::params_with(k, rng, L2Dist)
            .max_n_iterations(config.max_iters)
            .tolerance(config.tolerance)
            .fit(&dataset)?;
        model.predict(matrix)
    };

    let labels: Vec<usize> = assignments.to_vec();
    let inertia = compute_inertia(matrix, &labels);
    let scores = score_clustering(matrix, &labels);
    let n_clusters = labels.iter().collect::<HashSet<_>>().len();

    info!(
        clusters = n_clusters,
        inertia,
        silhouette = scores.silhouette,
        "K-Means fitted"
    );

    Ok(Clustering {
        algorithm: Algorithm::KMeans,
        labels: labels.into_iter().map(ClusterLabel::Cluster).collect(),
        n_clusters,
        scores,
        inertia: Some(inertia),
    })
}

/// Fit DBSCAN on a standardised matrix
///
/// Rows outside every dense region are labelled [`ClusterLabel::Noise`].
/// Scores are computed over non-noise rows only.
pub fn fit_dbscan(matrix: &Array2<f64>, config: &AnalyticsConfig) -> crate::Result<Clustering> {
    if matrix.nrows() == 0 {
        anyhow::bail!("Cannot cluster an empty feature matrix");
    }

    let params = Dbscan::params(config.min_samples)
        .tolerance(config.eps)
        .check()?;
    let memberships: Array1<Option<usize>> = params.transform(matrix);

    let labels: Vec<ClusterLabel> = memberships
        .iter()
        .map(|m| m.map_or(ClusterLabel::Noise, ClusterLabel::Cluster))
        .collect();

    let clustered: Vec<usize> = memberships
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.map(|_| i))
        .collect();
    let clustered_labels: Vec<usize> = memberships.iter().filter_map(|m| *m).collect();
    let n_clusters = clustered_labels.iter().collect::<HashSet<_>>().len();

    let scores = if clustered.len() < 2 {
        ClusterScores::degenerate()
    } else {
        let subset = matrix.select(Axis(0), &clustered);
        score_clustering(&subset, &clustered_labels)
    };

    info!(
        clusters = n_clusters,
        noise = labels.len() - clustered.len(),
        silhouette = scores.silhouette,
        "DBSCAN fitted"
    );

    Ok(Clustering {
        algorithm: Algorithm::Dbscan,
        labels,
        n_clusters,
        scores,
        inertia: None,
    })
}

/// Silhouette and Calinski-Harabasz scores for a labelled matrix
///
/// Both are zero (and flagged degenerate) unless there are at least two
/// clusters and fewer clusters than rows.
pub fn score_clustering(matrix: &Array2<f64>, labels: &[usize]) -> ClusterScores {
    let n_labels = labels.iter().collect::<HashSet<_>>().len();
    if matrix.nrows() < 2 || n_labels < 2 || n_labels >= matrix.nrows() {
        debug!(rows = matrix.nrows(), clusters = n_labels, "Scoring skipped");
        return ClusterScores::degenerate();
    }

    ClusterScores {
        silhouette: silhouette_score(matrix, labels),
        calinski_harabasz: calinski_harabasz_score(matrix, labels),
        degenerate: false,
    }
}

/// Mean silhouette coefficient over all rows
///
/// Rows alone in their cluster contribute zero.
pub fn silhouette_score(matrix: &Array2<f64>, labels: &[usize]) -> f64 {
    let n_samples = matrix.nrows();
    if n_samples < 2 {
        return 0.0;
    }
    let n_labels = labels.iter().max().map_or(0, |m| m + 1);

    let mut silhouette_sum = 0.0;
    for i in 0..n_samples {
        let point = matrix.row(i);
        let own = labels[i];

        let mut sums = vec![0.0; n_labels];
        let mut counts = vec![0usize; n_labels];
        for j in 0..n_samples {
            if i == j {
                continue;
            }
            sums[labels[j]] += euclidean_distance(&point, &matrix.row(j));
            counts[labels[j]] += 1;
        }

        // Singleton clusters score zero
        if counts[own] == 0 {
            continue;
        }
        let a_i = sums[own] / counts[own] as f64;

        let b_i = (0..n_labels)
            .filter(|&c| c != own && counts[c] > 0)
            .map(|c| sums[c] / counts[c] as f64)
            .fold(f64::INFINITY, f64::min);

        let silhouette_i = if b_i.is_infinite() || (a_i == 0.0 && b_i == 0.0) {
            0.0
        } else {
            (b_i - a_i) / a_i.max(b_i)
        };
        silhouette_sum += silhouette_i;
    }

    silhouette_sum / n_samples as f64
}

/// Ratio of between-cluster to within-cluster dispersion
pub fn calinski_harabasz_score(matrix: &Array2<f64>, labels: &[usize]) -> f64 {
    let n_samples = matrix.nrows();
    let members = group_rows(labels);
    let k = members.len();
    if n_samples < 2 || k < 2 || k >= n_samples {
        return 0.0;
    }

    let Some(overall_mean) = matrix.mean_axis(Axis(0)) else {
        return 0.0;
    };

    let mut between = 0.0;
    let mut within = 0.0;
    for rows in members.values() {
        let cluster = matrix.select(Axis(0), rows);
        let Some(centroid) = cluster.mean_axis(Axis(0)) else {
            continue;
        };
        between += rows.len() as f64 * squared_distance(&centroid.view(), &overall_mean.view());
        within += cluster
            .outer_iter()
            .map(|row| squared_distance(&row, &centroid.view()))
            .sum::<f64>();
    }

    if within == 0.0 {
        return 1.0;
    }
    between * (n_samples - k) as f64 / (within * (k - 1) as f64)
}

/// Member count and raw-feature means of one cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterProfile {
    pub label: ClusterLabel,
    pub size: usize,
    /// Means in [`SEGMENT_FEATURES`] order
    pub means: [f64; 5],
}

impl fmt::Display for ClusterProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            ClusterLabel::Noise => writeln!(f, "Noise Points:")?,
            label => writeln!(f, "{}:", label)?,
        }
        writeln!(f, "  Number of customers: {}", self.size)?;
        writeln!(f, "  Average transaction count: {:.2}", self.means[0])?;
        writeln!(f, "  Average total spent: ${:.2}", self.means[1])?;
        writeln!(f, "  Average transaction value: ${:.2}", self.means[2])?;
        writeln!(f, "  Average days since last purchase: {:.2}", self.means[3])?;
        write!(f, "  Average unique categories: {:.2}", self.means[4])
    }
}

/// Summarise each cluster (and the noise bucket) in raw feature units
pub fn profile_clusters(
    features: &[CustomerFeatureVector],
    clustering: &Clustering,
) -> Vec<ClusterProfile> {
    let mut groups: BTreeMap<ClusterLabel, (usize, [f64; 5])> = BTreeMap::new();
    for (feature, label) in features.iter().zip(&clustering.labels) {
        let entry = groups.entry(*label).or_insert((0, [0.0; 5]));
        entry.0 += 1;
        for (sum, value) in entry.1.iter_mut().zip(feature.as_row()) {
            *sum += value;
        }
    }

    groups
        .into_iter()
        .map(|(label, (size, sums))| ClusterProfile {
            label,
            size,
            means: sums.map(|s| s / size as f64),
        })
        .collect()
}

/// One store row per customer for this clustering
pub fn segment_rows(features: &[CustomerFeatureVector], clustering: &Clustering) -> Vec<SegmentRow> {
    features
        .iter()
        .zip(&clustering.labels)
        .map(|(feature, label)| SegmentRow {
            customer_id: feature.customer_id.clone(),
            algorithm: clustering.algorithm,
            segment_name: label.segment_name(clustering.algorithm),
            cluster_id: label.id(),
        })
        .collect()
}

/// Both clusterings of one customer population, with their profiles
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub kmeans: Clustering,
    pub dbscan: Clustering,
    pub kmeans_profiles: Vec<ClusterProfile>,
    pub dbscan_profiles: Vec<ClusterProfile>,
}

impl Segmentation {
    /// Store rows for both algorithms
    pub fn segment_rows(&self, features: &[CustomerFeatureVector]) -> Vec<SegmentRow> {
        let mut rows = segment_rows(features, &self.kmeans);
        rows.extend(segment_rows(features, &self.dbscan));
        rows
    }
}

/// Standardise customer features and run both clustering algorithms
pub fn segment_customers(
    features: &[CustomerFeatureVector],
    config: &AnalyticsConfig,
) -> crate::Result<Segmentation> {
    let raw = feature_matrix(features);
    let (scaler, scaled) = StandardScaler::fit_transform(&raw);
    debug!(
        features = ?SEGMENT_FEATURES,
        means = ?scaler.means().to_vec(),
        "Scaled segmentation features"
    );

    let kmeans = fit_kmeans(&scaled, config)?;
    let dbscan = fit_dbscan(&scaled, config)?;

    Ok(Segmentation {
        kmeans_profiles: profile_clusters(features, &kmeans),
        dbscan_profiles: profile_clusters(features, &dbscan),
        kmeans,
        dbscan,
    })
}

fn group_rows(labels: &[usize]) -> BTreeMap<usize, Vec<usize>> {
    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (row, label) in labels.iter().enumerate() {
        members.entry(*label).or_default().push(row);
    }
    members
}

fn count_distinct_rows(matrix: &Array2<f64>) -> usize {
    matrix
        .outer_iter()
        .map(|row| row.iter().map(|v| v.to_bits()).collect::<Vec<u64>>())
        .collect::<HashSet<_>>()
        .len()
}

/// Compute within-cluster sum of squares (inertia)
fn compute_inertia(matrix: &Array2<f64>, labels: &[usize]) -> f64 {
    group_rows(labels)
        .values()
        .map(|rows| {
            let cluster = matrix.select(Axis(0), rows);
            match cluster.mean_axis(Axis(0)) {
                Some(centroid) => cluster
                    .outer_iter()
                    .map(|row| squared_distance(&row, &centroid.view()))
                    .sum::<f64>(),
                None => 0.0,
            }
        })
        .sum()
}

fn squared_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Calculate Euclidean distance between two points
fn euclidean_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    squared_distance(a, b).sqrt()
}
