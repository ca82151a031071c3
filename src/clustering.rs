use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansConfig {
    pub k: usize,
    pub max_iters: usize,
    pub restarts: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    pub centroids: Vec<Vec<f64>>,
    pub assignments: Vec<usize>,
    pub inertia: f64,
    pub iterations: usize,
}

impl KMeansFit {
    pub fn k(&self) -> usize {
        self.centroids.len()
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.k()];
        for &c in &self.assignments {
            sizes[c] += 1;
        }
        sizes
    }

    /// Root-mean-square member distance to the centroid, per cluster.
    pub fn cluster_spreads(&self, points: &[Vec<f64>]) -> Vec<f64> {
        let mut sq = vec![0.0_f64; self.k()];
        let mut n = vec![0usize; self.k()];
        for (point, &c) in points.iter().zip(&self.assignments) {
            sq[c] += squared_distance(point, &self.centroids[c]);
            n[c] += 1;
        }
        sq.iter()
            .zip(&n)
            .map(|(s, &count)| {
                if count == 0 {
                    0.0
                } else {
                    (s / count as f64).sqrt()
                }
            })
            .collect()
    }

    pub fn min_centroid_gap(&self) -> f64 {
        let mut best = f64::INFINITY;
        for i in 0..self.k() {
            for j in (i + 1)..self.k() {
                best = best.min(euclidean(&self.centroids[i], &self.centroids[j]));
            }
        }
        best
    }

    /// Renumbers clusters so centroids are in ascending lexicographic order.
    pub fn canonicalize(mut self) -> Self {
        let mut order = (0..self.k()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| lexicographic(&self.centroids[a], &self.centroids[b]));
        let mut remap = vec![0usize; self.k()];
        for (new_idx, &old_idx) in order.iter().enumerate() {
            remap[old_idx] = new_idx;
        }
        self.centroids = order.iter().map(|&i| self.centroids[i].clone()).collect();
        for a in &mut self.assignments {
            *a = remap[*a];
        }
        self
    }
}

/// Seeded k-means++ with Lloyd iterations. The same points, config and seed
/// always produce the same fit. Returns `None` when `k` is 0 or exceeds the
/// number of points.
pub fn kmeans(points: &[Vec<f64>], cfg: &KMeansConfig) -> Option<KMeansFit> {
    if cfg.k == 0 || cfg.k > points.len() {
        return None;
    }
    let mut best: Option<KMeansFit> = None;
    for restart in 0..cfg.restarts.max(1) {
        let seed = cfg.seed.wrapping_add(SEED_STRIDE.wrapping_mul(restart as u64));
        let fit = lloyd(points, cfg.k, cfg.max_iters.max(1), seed);
        let better = best.as_ref().is_none_or(|b| fit.inertia < b.inertia);
        if better {
            best = Some(fit);
        }
    }
    best
}

fn lloyd(points: &[Vec<f64>], k: usize, max_iters: usize, seed: u64) -> KMeansFit {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = plus_plus_init(points, k, &mut rng);
    let mut assignments = vec![usize::MAX; points.len()];
    let mut iterations = 0usize;

    for _ in 0..max_iters {
        iterations += 1;
        let mut changed = false;
        for (idx, point) in points.iter().enumerate() {
            let (nearest, _) = nearest_centroid(point, &centroids);
            if assignments[idx] != nearest {
                assignments[idx] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        centroids = recompute_centroids(points, &assignments, &centroids);
    }

    let inertia = points
        .iter()
        .zip(&assignments)
        .map(|(p, &c)| squared_distance(p, &centroids[c]))
        .sum();
    KMeansFit {
        centroids,
        assignments,
        inertia,
        iterations,
    }
}

fn plus_plus_init(points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.gen_range(0..points.len())].clone());
    let mut d2 = points
        .iter()
        .map(|p| squared_distance(p, &centroids[0]))
        .collect::<Vec<_>>();

    while centroids.len() < k {
        let total: f64 = d2.iter().sum();
        let next = if total > 0.0 {
            let target = rng.gen_range(0.0..total);
            let mut acc = 0.0;
            let mut chosen = d2.len() - 1;
            for (idx, w) in d2.iter().enumerate() {
                acc += w;
                if acc > target {
                    chosen = idx;
                    break;
                }
            }
            chosen
        } else {
            // All remaining points coincide with a centroid; any pick is equivalent.
            rng.gen_range(0..points.len())
        };
        centroids.push(points[next].clone());
        let newest = centroids.len() - 1;
        for (idx, p) in points.iter().enumerate() {
            d2[idx] = d2[idx].min(squared_distance(p, &centroids[newest]));
        }
    }
    centroids
}

fn recompute_centroids(
    points: &[Vec<f64>],
    assignments: &[usize],
    previous: &[Vec<f64>],
) -> Vec<Vec<f64>> {
    let k = previous.len();
    let dim = previous.first().map(|c| c.len()).unwrap_or(0);
    let mut sums = vec![vec![0.0_f64; dim]; k];
    let mut counts = vec![0usize; k];
    for (point, &c) in points.iter().zip(assignments) {
        counts[c] += 1;
        for (s, x) in sums[c].iter_mut().zip(point) {
            *s += x;
        }
    }

    let mut out = Vec::with_capacity(k);
    for c in 0..k {
        if counts[c] == 0 {
            // Re-seed an empty cluster at the point farthest from its own centroid.
            let far = farthest_point(points, assignments, previous);
            out.push(points[far].clone());
            continue;
        }
        let n = counts[c] as f64;
        out.push(sums[c].iter().map(|s| s / n).collect());
    }
    out
}

fn farthest_point(points: &[Vec<f64>], assignments: &[usize], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0usize;
    let mut best_d = f64::NEG_INFINITY;
    for (idx, (p, &c)) in points.iter().zip(assignments).enumerate() {
        let d = squared_distance(p, &centroids[c]);
        if d > best_d {
            best_d = d;
            best = idx;
        }
    }
    best
}

/// Index and Euclidean distance of the nearest centroid; ties go to the lower index.
pub fn nearest_centroid(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = 0usize;
    let mut best_d = f64::INFINITY;
    for (idx, c) in centroids.iter().enumerate() {
        let d = squared_distance(point, c);
        if d < best_d {
            best_d = d;
            best = idx;
        }
    }
    (best, best_d.sqrt())
}

pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    squared_distance(a, b).sqrt()
}

/// Calinski-Harabasz variance ratio: between-cluster over within-cluster
/// dispersion, each normalized by its degrees of freedom. Higher is better.
pub fn calinski_harabasz(points: &[Vec<f64>], fit: &KMeansFit) -> f64 {
    let n = points.len();
    let k = fit.k();
    if k < 2 || n <= k {
        return 0.0;
    }
    let dim = points[0].len();
    let mut grand = vec![0.0_f64; dim];
    for p in points {
        for (g, x) in grand.iter_mut().zip(p) {
            *g += x;
        }
    }
    for g in &mut grand {
        *g /= n as f64;
    }

    let sizes = fit.cluster_sizes();
    let between: f64 = fit
        .centroids
        .iter()
        .zip(&sizes)
        .map(|(c, &size)| size as f64 * squared_distance(c, &grand))
        .sum();
    let within = fit.inertia;
    if within <= f64::EPSILON {
        return f64::MAX;
    }
    (between / (k - 1) as f64) / (within / (n - k) as f64)
}

fn lexicographic(a: &[f64], b: &[f64]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = x.total_cmp(y);
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> Vec<Vec<f64>> {
        let mut out = Vec::new();
        for i in 0..10 {
            let jitter = i as f64 * 0.01;
            out.push(vec![0.0 + jitter, 0.0 - jitter]);
            out.push(vec![5.0 + jitter, 5.0 - jitter]);
            out.push(vec![-5.0 - jitter, 5.0 + jitter]);
        }
        out
    }

    fn cfg(k: usize) -> KMeansConfig {
        KMeansConfig {
            k,
            max_iters: 100,
            restarts: 3,
            seed: 7,
        }
    }

    #[test]
    fn separates_obvious_blobs() {
        let points = blobs();
        let fit = kmeans(&points, &cfg(3)).unwrap().canonicalize();
        assert_eq!(fit.cluster_sizes(), vec![10, 10, 10]);
        assert!(fit.centroids[0][0] < -4.0);
        assert!(fit.min_centroid_gap() > 5.0);
    }

    #[test]
    fn same_seed_same_fit() {
        let points = blobs();
        let a = kmeans(&points, &cfg(4)).unwrap();
        let b = kmeans(&points, &cfg(4)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn true_k_scores_highest() {
        let points = blobs();
        let score = |k| calinski_harabasz(&points, &kmeans(&points, &cfg(k)).unwrap());
        assert!(score(3) > score(2));
        assert!(score(3) > score(5));
    }

    #[test]
    fn k_larger_than_population_is_rejected() {
        assert!(kmeans(&[vec![1.0]], &cfg(2)).is_none());
    }

    #[test]
    fn nearest_prefers_lower_index_on_tie() {
        let centroids = vec![vec![1.0], vec![-1.0]];
        assert_eq!(nearest_centroid(&[0.0], &centroids), (0, 1.0));
    }
}
