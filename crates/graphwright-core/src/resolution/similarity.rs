use crate::entity::normalize_name;

/// Cosine similarity of two vectors.
///
/// Returns `0.0` for empty input, mismatched lengths, or zero vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Scales to unit length. A zero vector stays zero.
#[must_use]
pub fn normalize_l2(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Element-wise mean of the vectors that share the first vector's length.
#[must_use]
pub fn centroid(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut sum = vec![0.0_f32; first.len()];
    let mut count = 0_u16;
    for v in vectors.iter().filter(|v| v.len() == first.len()) {
        for (acc, x) in sum.iter_mut().zip(v.iter()) {
            *acc += x;
        }
        count = count.saturating_add(1);
    }
    let count = f32::from(count.max(1));
    sum.into_iter().map(|x| x / count).collect()
}

/// Jaro-Winkler similarity of two names after normalisation.
///
/// A name that contains the other as a whole-word prefix, like
/// "python" and "python language", scores at least 0.9.
#[must_use]
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let score = strsim::jaro_winkler(&a, &b);
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    let word_prefix = long.starts_with(short.as_str()) && long[short.len()..].starts_with(' ');
    if word_prefix {
        score.max(0.9)
    } else {
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_edge_cases() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!(cosine_similarity(&[], &[]).abs() < f32::EPSILON);
        assert!(cosine_similarity(&[1.0], &[1.0, 2.0]).abs() < f32::EPSILON);
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]).abs() < f32::EPSILON);
    }

    #[test]
    fn test_centroid_and_normalize() {
        let a = [1.0_f32, 0.0];
        let b = [0.0_f32, 1.0];
        assert_eq!(centroid(&[&a, &b]), vec![0.5, 0.5]);
        let unit = normalize_l2(&[3.0, 4.0]);
        assert!((unit[0] - 0.6).abs() < 1e-6);
        assert_eq!(normalize_l2(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_name_similarity() {
        assert!((name_similarity("Python", " python ") - 1.0).abs() < f64::EPSILON);
        assert!(name_similarity("Python", "Python language") >= 0.9);
        assert!(name_similarity("Python", "Haskell") < 0.7);
        assert!(name_similarity("", "x").abs() < f64::EPSILON);
    }
}
