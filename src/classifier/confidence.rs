//! Entropy-based prediction confidence.
//!
//! `confidence(p) = (ln N - H(p)) / ln N`: 0 for a uniform guess over N
//! categories, 1 for a one-hot prediction. Only entries `> 0` contribute to
//! `H(p)`, so zero probabilities never reach `ln`.

/// Shannon entropy in nats.
pub fn entropy(p: &[f32]) -> f64 {
    -p.iter()
        .filter(|&&x| x > 0.0)
        .map(|&x| {
            let x = f64::from(x);
            x * x.ln()
        })
        .sum::<f64>()
}

pub fn confidence(p: &[f32]) -> f64 {
    let n = p.len();
    if n <= 1 {
        return 1.0;
    }
    let max_entropy = (n as f64).ln();
    ((max_entropy - entropy(p)) / max_entropy).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_is_zero() {
        for n in 2..8 {
            let p = vec![1.0 / n as f32; n];
            assert!(confidence(&p).abs() < 1e-6, "n = {n}");
        }
    }

    #[test]
    fn test_one_hot_is_exactly_one() {
        assert_eq!(confidence(&[0.0, 1.0, 0.0]), 1.0);
        assert_eq!(confidence(&[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_bounds_on_arbitrary_distributions() {
        let cases: [&[f32]; 5] = [
            &[0.7, 0.2, 0.1],
            &[0.5, 0.5, 0.0],
            &[0.01, 0.01, 0.98],
            &[0.25, 0.25, 0.25, 0.25],
            &[0.9, 0.1],
        ];
        for p in cases {
            let c = confidence(p);
            assert!((0.0..=1.0).contains(&c), "{p:?} -> {c}");
        }
    }

    #[test]
    fn test_more_peaked_is_more_confident() {
        assert!(confidence(&[0.9, 0.05, 0.05]) > confidence(&[0.6, 0.2, 0.2]));
    }

    #[test]
    fn test_entropy_ignores_zero_entries() {
        let h = entropy(&[0.5, 0.0, 0.5]);
        assert!((h - 2f64.ln()).abs() < 1e-9);
        assert!(h.is_finite());
    }

    #[test]
    fn test_single_category() {
        assert_eq!(confidence(&[1.0]), 1.0);
    }
}
