// THEORY:
// The camera classifier produces a score per ImageNet class; turning those scores
// into "the food on the table" is plain arithmetic that lives here, away from
// OpenCV: softmax, top-k, and a keyword scan over the top labels in rank order.
// The first label mentioning any food keyword wins.

use crate::error::{DiningError, DiningResult};
use std::path::Path;

/// Reads class labels from a JSON array or a newline-separated text file.
pub fn load_labels(path: &Path) -> DiningResult<Vec<String>> {
    if !path.exists() {
        return Err(DiningError::NotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let labels: Vec<String> = if is_json {
        serde_json::from_str(&contents)
            .map_err(|e| DiningError::Classification(format!("{}: {}", path.display(), e)))?
    } else {
        contents
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    };

    if labels.is_empty() {
        return Err(DiningError::Classification(format!("{} holds no labels", path.display())));
    }
    Ok(labels)
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

/// Indices of the `k` largest scores, best first.
pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    indices.truncate(k);
    indices
}

/// First candidate (in rank order) containing any keyword, case-insensitively.
pub fn match_food_label<'a, S: AsRef<str>>(candidates: &'a [S], keywords: &[String]) -> Option<&'a str> {
    candidates.iter().map(|c| c.as_ref()).find(|label| {
        let lower = label.to_lowercase();
        keywords.iter().any(|word| lower.contains(&word.to_lowercase()))
    })
}
