//! Small shared helpers: name validation and random sampling.

use rand::Rng;

pub const MAX_NAME_LENGTH: usize = 64;

/// Validate a topic or channel name: non-empty, at most 64 characters from
/// `[a-zA-Z0-9._-]`, with an optional `#ephemeral` suffix.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    if base.is_empty() {
        return false;
    }
    base.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

/// `quantity` distinct indices drawn uniformly from `0..max`, via a partial
/// Fisher-Yates shuffle.
pub fn uniq_rands(quantity: usize, max: usize) -> Vec<usize> {
    let quantity = quantity.min(max);
    let mut values: Vec<usize> = (0..max).collect();
    let mut rng = rand::thread_rng();
    for i in 0..quantity {
        let j = i + rng.gen_range(0..max - i);
        values.swap(i, j);
    }
    values.truncate(quantity);
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn accepts_reasonable_names() {
        for name in ["orders", "orders.v2", "a-b_c.d", "orders#ephemeral", "x"] {
            assert!(is_valid_name(name), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_bad_names() {
        let long = "a".repeat(MAX_NAME_LENGTH + 1);
        for name in ["", "#ephemeral", "sp ace", "slash/", "uni\u{e9}", long.as_str()] {
            assert!(!is_valid_name(name), "{name:?} should be invalid");
        }
    }

    #[test]
    fn uniq_rands_yields_distinct_in_range_indices() {
        for _ in 0..50 {
            let picks = uniq_rands(20, 100);
            assert_eq!(picks.len(), 20);
            let set: HashSet<usize> = picks.iter().copied().collect();
            assert_eq!(set.len(), 20);
            assert!(picks.iter().all(|&i| i < 100));
        }
    }

    #[test]
    fn uniq_rands_clamps_to_the_population() {
        let picks = uniq_rands(20, 3);
        assert_eq!(picks.len(), 3);
        let set: HashSet<usize> = picks.iter().copied().collect();
        assert_eq!(set, HashSet::from([0, 1, 2]));
    }
}
