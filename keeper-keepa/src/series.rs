//! Packed historical price series, as returned by the upstream API.
//!
//! `csv[i]` selects a series by type; each series is a flat chronological
//! sequence `[t0, v0, t1, v1, ...]`. Values are integer cents, except
//! RATING (rating × 10) and SALES_RANK (a rank, not a price). The sentinel
//! -1 means "not available at this time", -2 "series never populated".

pub const AMAZON: usize = 0;
pub const MARKETPLACE_NEW: usize = 1;
pub const MARKETPLACE_USED: usize = 2;
pub const SALES_RANK: usize = 3;
pub const LIST_PRICE: usize = 4;
pub const NEW_FBA: usize = 7;
pub const WAREHOUSE: usize = 9;
pub const BUY_BOX: usize = 11;
pub const USED_LIKE_NEW: usize = 12;
pub const RATING: usize = 16;
pub const REVIEW_COUNT: usize = 17;
pub const BUY_BOX_USED: usize = 18;

/// Order in which series are consulted for the current price.
pub const PRICE_PRIORITY: [usize; 7] = [
    AMAZON,
    BUY_BOX,
    NEW_FBA,
    MARKETPLACE_NEW,
    USED_LIKE_NEW,
    BUY_BOX_USED,
    WAREHOUSE,
];

pub type PackedSeries = Vec<Option<Vec<i64>>>;

/// Last usable raw value of one packed series: walk value slots (odd
/// indexes) backwards past the -1/-2 sentinels.
pub fn last_valid_value(series: &[i64]) -> Option<i64> {
    if series.len() < 2 {
        return None;
    }
    series
        .iter()
        .skip(1)
        .step_by(2)
        .rev()
        .copied()
        .find(|v| *v > 0)
}

fn series_price(csv: &PackedSeries, index: usize) -> Option<f64> {
    let series = csv.get(index)?.as_ref()?;
    last_valid_value(series).map(|cents| cents as f64 / 100.0)
}

/// Current price in currency units via the priority chain, or None when
/// every series in the chain is empty or all-sentinel.
pub fn extract_current_price(csv: &PackedSeries) -> Option<f64> {
    PRICE_PRIORITY
        .iter()
        .find_map(|index| series_price(csv, *index))
}

pub fn extract_list_price(csv: &PackedSeries) -> Option<f64> {
    series_price(csv, LIST_PRICE)
}

pub fn extract_sales_rank(csv: &PackedSeries) -> Option<i64> {
    let series = csv.get(SALES_RANK)?.as_ref()?;
    last_valid_value(series)
}

pub fn extract_review_count(csv: &PackedSeries) -> Option<i64> {
    let series = csv.get(REVIEW_COUNT)?.as_ref()?;
    last_valid_value(series)
}

pub fn extract_rating(csv: &PackedSeries) -> Option<f64> {
    let series = csv.get(RATING)?.as_ref()?;
    last_valid_value(series).map(|raw| normalize_rating(raw as f64))
}

/// The rating series stores half-stars as integers (45 = 4.5 stars).
pub fn normalize_rating(raw: f64) -> f64 {
    if raw > 10.0 {
        raw / 10.0
    } else {
        raw
    }
}

/// Same priority walk over a flat `stats.current` style array, where slot i
/// holds the latest value of series i.
pub fn price_from_current_array(current: &[i64]) -> Option<f64> {
    PRICE_PRIORITY
        .iter()
        .filter_map(|index| current.get(*index))
        .copied()
        .find(|v| *v > 0)
        .map(|cents| cents as f64 / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_with(entries: &[(usize, Vec<i64>)]) -> PackedSeries {
        let max = entries.iter().map(|(i, _)| *i).max().unwrap_or(0);
        let mut csv: PackedSeries = vec![None; max + 1];
        for (index, series) in entries {
            csv[*index] = Some(series.clone());
        }
        csv
    }

    #[test]
    fn amazon_series_wins_the_priority_chain() {
        let csv = csv_with(&[
            (AMAZON, vec![100, 4499]),
            (BUY_BOX, vec![100, 3999]),
        ]);
        assert_eq!(extract_current_price(&csv), Some(44.99));
    }

    #[test]
    fn chain_falls_through_sentinel_series() {
        let csv = csv_with(&[
            (AMAZON, vec![100, -1, 200, -1]),
            (BUY_BOX, vec![100, -2]),
            (NEW_FBA, vec![100, 2350]),
        ]);
        assert_eq!(extract_current_price(&csv), Some(23.50));
    }

    #[test]
    fn trailing_sentinel_walks_back_to_the_last_usable_value() {
        let csv = csv_with(&[(AMAZON, vec![100, 5500, 200, -1])]);
        assert_eq!(extract_current_price(&csv), Some(55.00));
    }

    #[test]
    fn all_negative_series_yield_no_price() {
        let csv = csv_with(&[
            (AMAZON, vec![100, -1]),
            (BUY_BOX, vec![100, -2, 200, -1]),
        ]);
        assert_eq!(extract_current_price(&csv), None);
    }

    #[test]
    fn missing_and_empty_series_are_skipped() {
        let mut csv: PackedSeries = vec![None; 12];
        csv[BUY_BOX] = Some(vec![]);
        assert_eq!(extract_current_price(&csv), None);
        assert_eq!(extract_current_price(&vec![]), None);
    }

    #[test]
    fn rating_is_stored_in_half_stars() {
        assert_eq!(normalize_rating(45.0), 4.5);
        assert_eq!(normalize_rating(4.5), 4.5);
        let csv = csv_with(&[(RATING, vec![100, 43])]);
        assert_eq!(extract_rating(&csv), Some(4.3));
    }

    #[test]
    fn sales_rank_and_reviews_read_their_series() {
        let csv = csv_with(&[
            (SALES_RANK, vec![100, 1500, 200, 1200]),
            (REVIEW_COUNT, vec![100, 834]),
        ]);
        assert_eq!(extract_sales_rank(&csv), Some(1200));
        assert_eq!(extract_review_count(&csv), Some(834));
    }

    #[test]
    fn current_array_walks_the_same_priority() {
        // Slot layout: 0=Amazon .. 11=BuyBox; Amazon absent, buy box set.
        let mut current = vec![-1i64; 19];
        current[BUY_BOX] = 2999;
        current[WAREHOUSE] = 1999;
        assert_eq!(price_from_current_array(&current), Some(29.99));
        assert_eq!(price_from_current_array(&[-1, -1, -2]), None);
    }
}
