//! Elbow-method K-selection — spec.md §4.4 `select_optimal_k`.

/// Outcome of one candidate K's clustering job.
#[derive(Debug, Clone, Copy)]
pub struct KCandidateResult {
    pub k: u32,
    pub sse: f64,
}

#[derive(Debug, Clone)]
pub struct ElbowResult {
    pub optimal_k: u32,
    pub confidence: f64,
    pub sse_curve: Vec<(u32, f64)>,
}

/// Warnings the caller must surface (non-fatal) per spec §4.4 step 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElbowWarning {
    /// Some candidates failed but at least 3 succeeded — elbow computed on the survivors.
    KSelectionPartial,
    /// Fewer than 3 candidates succeeded — fell back to the configured default K.
    KSelectionFallback,
}

/// Locate the elbow: for each interior K, the perpendicular distance from
/// `(k, sse_k)` to the chord connecting the first and last candidate points.
/// Ties within 1% of the max distance are broken toward the smaller K.
///
/// Invariant (spec §8 property 8): invariant under uniform scaling of all
/// SSE values and under a constant SSE offset, and always returns an
/// element of the input K set.
pub fn elbow_pick(results: &[KCandidateResult]) -> ElbowResult {
    assert!(results.len() >= 2, "elbow_pick requires at least 2 points");

    let first = results[0];
    let last = results[results.len() - 1];

    // Direction vector of the chord from first to last point.
    let dx = last.k as f64 - first.k as f64;
    let dy = last.sse - first.sse;
    let norm = (dx * dx + dy * dy).sqrt();

    let distance = |p: &KCandidateResult| -> f64 {
        if norm == 0.0 {
            return 0.0;
        }
        // |cross product| / |chord length| = perpendicular distance.
        let px = p.k as f64 - first.k as f64;
        let py = p.sse - first.sse;
        (dx * py - dy * px).abs() / norm
    };

    let distances: Vec<(u32, f64)> = results.iter().map(|p| (p.k, distance(p))).collect();

    let max_distance = distances.iter().map(|(_, d)| *d).fold(0.0_f64, f64::max);
    let threshold = max_distance * 0.99;

    // Tie-break: prefer the smallest k among those within 1% of the max.
    let optimal_k = distances
        .iter()
        .filter(|(_, d)| *d >= threshold)
        .map(|(k, _)| *k)
        .min()
        .unwrap_or(first.k);

    let mean_distance = distances.iter().map(|(_, d)| *d).sum::<f64>() / distances.len() as f64;
    let confidence = if mean_distance > 0.0 { max_distance / mean_distance } else { 0.0 };

    ElbowResult {
        optimal_k,
        confidence,
        sse_curve: results.iter().map(|r| (r.k, r.sse)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(pairs: &[(u32, f64)]) -> Vec<KCandidateResult> {
        pairs.iter().map(|(k, sse)| KCandidateResult { k: *k, sse: *sse }).collect()
    }

    #[test]
    fn scenario_s3_picks_k3() {
        let results = candidates(&[(2, 1000.0), (3, 600.0), (4, 580.0), (5, 570.0), (6, 565.0)]);
        let elbow = elbow_pick(&results);
        assert_eq!(elbow.optimal_k, 3);
        assert!(elbow.confidence > 0.0);
    }

    #[test]
    fn invariant_under_uniform_scaling() {
        let base = candidates(&[(2, 1000.0), (3, 600.0), (4, 580.0), (5, 570.0), (6, 565.0)]);
        let scaled = candidates(&[(2, 2000.0), (3, 1200.0), (4, 1160.0), (5, 1140.0), (6, 1130.0)]);

        let e1 = elbow_pick(&base);
        let e2 = elbow_pick(&scaled);
        assert_eq!(e1.optimal_k, e2.optimal_k);
    }

    #[test]
    fn invariant_under_constant_offset() {
        let base = candidates(&[(2, 1000.0), (3, 600.0), (4, 580.0), (5, 570.0), (6, 565.0)]);
        let offset = candidates(&[(2, 1100.0), (3, 700.0), (4, 680.0), (5, 670.0), (6, 665.0)]);

        let e1 = elbow_pick(&base);
        let e2 = elbow_pick(&offset);
        assert_eq!(e1.optimal_k, e2.optimal_k);
    }

    #[test]
    fn result_always_in_candidate_set() {
        let results = candidates(&[(2, 900.0), (3, 890.0), (4, 889.0), (5, 888.5), (6, 888.0)]);
        let elbow = elbow_pick(&results);
        assert!(results.iter().any(|r| r.k == elbow.optimal_k));
    }
}
