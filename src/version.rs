use std::cmp::Ordering;

/// Compare two product version strings as dot-separated integer tuples.
///
/// Any non-digit run acts as a separator, so "8.2.1", "8.2-1" and
/// "8.2.1-build7" all parse. The shorter tuple is zero-padded to the
/// longer's length before pointwise comparison, making "8.2" == "8.2.0".
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let va = segments(a);
    let vb = segments(b);
    let len = va.len().max(vb.len());
    for i in 0..len {
        let x = va.get(i).copied().unwrap_or(0);
        let y = vb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// True when `candidate` reports an older product version than `source`.
pub fn is_older_than(candidate: &str, source: &str) -> bool {
    compare_versions(candidate, source) == Ordering::Less
}

fn segments(version: &str) -> Vec<u64> {
    version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().unwrap_or(u64::MAX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_pointwise_comparison() {
        assert_eq!(compare_versions("8.2.1", "8.2.0"), Ordering::Greater);
        assert_eq!(compare_versions("8.2", "8.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("7.6.0", "8.0"), Ordering::Less);
        assert_eq!(compare_versions("8.10", "8.9"), Ordering::Greater);
    }

    #[test]
    fn tolerates_non_digit_separators() {
        assert_eq!(compare_versions("8.2-1", "8.2.1"), Ordering::Equal);
        assert_eq!(compare_versions("8.2.1-build7", "8.2.1.7"), Ordering::Equal);
        assert_eq!(compare_versions("", "0.0"), Ordering::Equal);
    }

    #[test]
    fn antisymmetric_over_a_sample_grid() {
        let samples = ["8.2.1", "8.2", "8.2.0.5", "7.6-9", "10.0", "", "1"];
        for a in samples {
            for b in samples {
                assert_eq!(
                    compare_versions(a, b),
                    compare_versions(b, a).reverse(),
                    "antisymmetry violated for ({a}, {b})"
                );
            }
        }
    }
}
