use std::collections::VecDeque;

use super::similarity::cosine_distance;

/// Density-based clustering over cosine distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dbscan {
    /// Neighbourhood radius.
    pub eps: f32,
    /// Neighbours, the point itself included, needed to be a core point.
    pub min_samples: usize,
}

impl Dbscan {
    #[must_use]
    pub const fn new(eps: f32, min_samples: usize) -> Self {
        Self { eps, min_samples }
    }

    /// Cluster label per point; `None` marks noise.
    #[must_use]
    pub fn fit(&self, points: &[Vec<f32>]) -> Vec<Option<usize>> {
        let mut labels: Vec<Option<usize>> = vec![None; points.len()];
        let mut visited = vec![false; points.len()];
        let mut next_label = 0;

        for start in 0..points.len() {
            if visited[start] {
                continue;
            }
            visited[start] = true;

            let neighbours = self.region(points, start);
            if neighbours.len() < self.min_samples {
                continue;
            }

            let label = next_label;
            next_label += 1;
            labels[start] = Some(label);

            let mut queue: VecDeque<usize> = neighbours.into();
            while let Some(point) = queue.pop_front() {
                if labels[point].is_none() {
                    labels[point] = Some(label);
                }
                if visited[point] {
                    continue;
                }
                visited[point] = true;

                let expansion = self.region(points, point);
                if expansion.len() >= self.min_samples {
                    queue.extend(expansion.into_iter().filter(|p| labels[*p].is_none() || !visited[*p]));
                }
            }
        }

        labels
    }

    /// Point indices grouped by cluster in order of first appearance. Noise
    /// points become singleton clusters so every point is placed exactly once.
    #[must_use]
    pub fn clusters(&self, points: &[Vec<f32>]) -> Vec<Vec<usize>> {
        let labels = self.fit(points);
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        let mut slot_of_label: Vec<Option<usize>> = Vec::new();

        for (point, label) in labels.into_iter().enumerate() {
            match label {
                Some(label) => {
                    if slot_of_label.len() <= label {
                        slot_of_label.resize(label + 1, None);
                    }
                    match slot_of_label[label] {
                        Some(slot) => clusters[slot].push(point),
                        None => {
                            slot_of_label[label] = Some(clusters.len());
                            clusters.push(vec![point]);
                        }
                    }
                }
                None => clusters.push(vec![point]),
            }
        }

        clusters
    }

    fn region(&self, points: &[Vec<f32>], center: usize) -> Vec<usize> {
        (0..points.len())
            .filter(|&other| cosine_distance(&points[center], &points[other]) <= self.eps)
            .collect()
    }
}
