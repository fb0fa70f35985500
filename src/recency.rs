//! Weeks elapsed since an indicator was last true.

/// `None` until the indicator is first true; 0 on true weeks.
pub fn time_since_last(indicator: &[bool]) -> Vec<Option<u32>> {
    let mut false_count = 0u32;
    let mut false_count_at_last_true: Option<u32> = None;

    indicator
        .iter()
        .map(|active| {
            if *active {
                false_count_at_last_true = Some(false_count);
            } else {
                false_count += 1;
            }
            false_count_at_last_true.map(|at_true| false_count - at_true)
        })
        .collect()
}

pub fn recency_values(recency: &[Option<u32>]) -> Vec<Option<f64>> {
    recency.iter().map(|r| r.map(f64::from)).collect()
}

/// 1 when the indicator was true within the last `weeks` weeks (inclusive),
/// 0 otherwise, including when it has never been true.
pub fn within_last(recency: &[Option<u32>], weeks: u32) -> Vec<Option<f64>> {
    recency
        .iter()
        .map(|r| Some(if matches!(r, Some(v) if *v <= weeks) { 1.0 } else { 0.0 }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(raw: &[u8]) -> Vec<bool> {
        raw.iter().map(|v| *v != 0).collect()
    }

    #[test]
    fn counts_weeks_since_last_true() {
        let out = time_since_last(&flags(&[0, 0, 1, 0, 0, 0, 1, 0]));
        assert_eq!(
            out,
            vec![None, None, Some(0), Some(1), Some(2), Some(3), Some(0), Some(1)]
        );
    }

    #[test]
    fn all_false_is_never_defined() {
        assert!(time_since_last(&flags(&[0, 0, 0])).iter().all(Option::is_none));
        assert!(time_since_last(&[]).is_empty());
    }

    #[test]
    fn within_last_treats_never_as_zero() {
        let recency = vec![None, Some(0), Some(4), Some(5)];
        assert_eq!(
            within_last(&recency, 4),
            vec![Some(0.0), Some(1.0), Some(1.0), Some(0.0)]
        );
    }
}
