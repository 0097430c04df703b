//! Probability-weighted choice shared by backend, credential and proxy selection.

/// Source of uniform draws for [`pick_weighted`].
pub trait RandomSource: Send + Sync {
    /// A uniform value in `[0, 1)`.
    fn unit(&self) -> f64;

    /// A uniform index in `[0, len)`. `len` is never zero.
    fn index(&self, len: usize) -> usize {
        let idx = (self.unit() * len as f64) as usize;
        idx.min(len.saturating_sub(1))
    }
}

/// Operating-system randomness via `getrandom`.
///
/// If the OS cannot supply entropy the draw is `0.0`, which deterministically
/// selects the first eligible item, and the failure is logged at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecureRandom;

impl RandomSource for SecureRandom {
    fn unit(&self) -> f64 {
        unit_from(getrandom::fill)
    }
}

fn unit_from<E: std::fmt::Display>(fill: impl FnOnce(&mut [u8]) -> Result<(), E>) -> f64 {
    let mut bytes = [0u8; 8];
    match fill(&mut bytes) {
        Ok(()) => {
            let bits = u64::from_le_bytes(bytes) >> 11;
            bits as f64 / (1u64 << 53) as f64
        }
        Err(err) => {
            tracing::error!(error = %err, "os randomness unavailable, selecting first eligible item");
            0.0
        }
    }
}

/// Returns one item with probability proportional to its weight.
///
/// Negative and non-finite weights count as zero. When every weight is zero the
/// choice is uniform. Returns `None` only for an empty slice.
pub fn pick_weighted<'a, T>(
    items: &'a [T],
    weight: impl Fn(&T) -> f64,
    rng: &dyn RandomSource,
) -> Option<&'a T> {
    let last = items.last()?;
    if items.len() == 1 {
        return Some(last);
    }

    let weights: Vec<f64> = items.iter().map(|item| sanitize(weight(item))).collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return items.get(rng.index(items.len()));
    }

    let draw = rng.unit() * total;
    let mut cumulative = 0.0;
    for (item, weight) in items.iter().zip(weights) {
        cumulative += weight;
        if cumulative >= draw && weight > 0.0 {
            return Some(item);
        }
    }
    Some(last)
}

fn sanitize(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Always draws the same unit value.
    pub(crate) struct FixedRandom(pub f64);

    impl RandomSource for FixedRandom {
        fn unit(&self) -> f64 {
            self.0
        }
    }

    struct FailingEntropy;

    impl RandomSource for FailingEntropy {
        fn unit(&self) -> f64 {
            unit_from(|_: &mut [u8]| Err("no entropy"))
        }
    }

    #[test]
    fn entropy_failure_is_not_disguised_as_a_random_draw() {
        assert_eq!(unit_from(|_: &mut [u8]| Err("no entropy")), 0.0);

        let items = [("a", 1.0), ("b", 1.0)];
        let picked = pick_weighted(&items, |item| item.1, &FailingEntropy).expect("pick");
        assert_eq!(picked.0, "a");
    }

    #[test]
    fn os_entropy_draws_stay_in_unit_range() {
        for _ in 0..1_000 {
            let draw = SecureRandom.unit();
            assert!((0.0..1.0).contains(&draw), "{draw}");
        }
        let max = unit_from(|bytes: &mut [u8]| -> Result<(), &str> {
            bytes.fill(0xff);
            Ok(())
        });
        assert!(max < 1.0);
    }

    #[test]
    fn single_item_is_always_returned() {
        let items = [("only", 0.0)];
        for _ in 0..100 {
            let picked = pick_weighted(&items, |item| item.1, &SecureRandom).expect("pick");
            assert_eq!(picked.0, "only");
        }
    }

    #[test]
    fn empty_slice_yields_none() {
        let items: [(&str, f64); 0] = [];
        assert!(pick_weighted(&items, |item| item.1, &SecureRandom).is_none());
    }

    #[test]
    fn frequencies_converge_to_weight_ratio() {
        let items = [("a", 1.0), ("b", 3.0), ("c", 6.0)];
        let draws = 50_000;
        let mut counts = [0usize; 3];
        for _ in 0..draws {
            let picked = pick_weighted(&items, |item| item.1, &SecureRandom).expect("pick");
            let idx = items
                .iter()
                .position(|item| item.0 == picked.0)
                .expect("known item");
            counts[idx] += 1;
        }
        for (idx, item) in items.iter().enumerate() {
            let expected = item.1 / 10.0;
            let observed = counts[idx] as f64 / draws as f64;
            assert!(
                (observed - expected).abs() < 0.02,
                "item {} observed {observed} expected {expected}",
                item.0
            );
        }
    }

    #[test]
    fn zero_weights_give_every_item_a_chance() {
        let items = [("a", 0.0), ("b", 0.0), ("c", 0.0)];
        let mut seen = [false; 3];
        for _ in 0..2_000 {
            let picked = pick_weighted(&items, |item| item.1, &SecureRandom).expect("pick");
            let idx = items
                .iter()
                .position(|item| item.0 == picked.0)
                .expect("known item");
            seen[idx] = true;
        }
        assert_eq!(seen, [true, true, true]);
    }

    #[test]
    fn zero_weight_items_are_skipped_when_total_is_positive() {
        let items = [("zero", 0.0), ("one", 1.0)];
        let picked = pick_weighted(&items, |item| item.1, &FixedRandom(0.0)).expect("pick");
        assert_eq!(picked.0, "one");
    }

    #[test]
    fn draw_past_total_falls_back_to_last_item() {
        let items = [("a", 1.0), ("b", 1.0)];
        let picked = pick_weighted(&items, |item| item.1, &FixedRandom(1.5)).expect("pick");
        assert_eq!(picked.0, "b");
    }

    #[test]
    fn negative_and_nan_weights_count_as_zero() {
        let items = [("neg", -5.0), ("nan", f64::NAN), ("ok", 2.0)];
        for _ in 0..200 {
            let picked = pick_weighted(&items, |item| item.1, &SecureRandom).expect("pick");
            assert_eq!(picked.0, "ok");
        }
    }
}
