use crate::normalize::Deal;

pub const MIN_RATING: f64 = 3.5;
pub const MIN_PRICE: f64 = 10.0;
pub const MAX_DISCOUNT: f64 = 80.0;
const SPAM_TITLE_KEYWORDS: [&str; 2] = ["dropship", "fast shipping"];

/// Composite deal score in [0, 100]:
/// 50% discount, 35% rating, 10% sales rank, 5% price attractiveness.
pub fn score_deal(deal: &Deal) -> f64 {
    let rating_score = if deal.rating > 0.0 {
        deal.rating / 5.0 * 100.0
    } else {
        0.0
    };
    let rank_score = 100.0 * (1.0 - (deal.sales_rank as f64 / 100_000.0).min(1.0));
    let price_score = 100.0 * (1.0 - (deal.current_price / 500.0).min(1.0));

    let score = deal.discount_percent * 0.50
        + rating_score * 0.35
        + rank_score * 0.10
        + price_score * 0.05;

    (score.clamp(0.0, 100.0) * 100.0).round() / 100.0
}

/// Spam gate. A deal is dropped when any single rule fires.
pub fn is_valid_deal(deal: &Deal) -> bool {
    if deal.rating < MIN_RATING {
        return false;
    }
    if deal.current_price < MIN_PRICE {
        return false;
    }
    if deal.discount_percent > MAX_DISCOUNT {
        return false;
    }
    let title = deal.title.to_lowercase();
    if title.is_empty() || title == "unknown" {
        return false;
    }
    !SPAM_TITLE_KEYWORDS.iter().any(|kw| title.contains(kw))
}

pub fn filter_spam(deals: Vec<Deal>) -> Vec<Deal> {
    deals.into_iter().filter(is_valid_deal).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deal() -> Deal {
        Deal {
            asin: "B07W6JN8V8".to_string(),
            title: "Logitech K380 QWERTZ Tastatur".to_string(),
            current_price: 44.99,
            list_price: 59.99,
            discount_percent: 25.0,
            rating: 4.5,
            reviews: 834,
            sales_rank: 1200,
            prime_eligible: true,
            url: "https://amazon.de/dp/B07W6JN8V8".to_string(),
            source: "product_api".to_string(),
            category: None,
            domain_id: 3,
            domain: "de".to_string(),
            market: "DE".to_string(),
            layout: None,
            deal_score: 0.0,
        }
    }

    #[test]
    fn score_weights_sum_as_specified() {
        let d = deal();
        // discount 25 gives 12.5; rating 4.5 gives 90 * 0.35 = 31.5;
        // rank 1200 gives 98.8 * 0.1 = 9.88; price 44.99 gives 91.002 * 0.05
        assert_eq!(score_deal(&d), 58.43);
    }

    #[test]
    fn score_is_clamped_to_the_scale() {
        let mut d = deal();
        d.discount_percent = 100.0;
        d.rating = 5.0;
        d.sales_rank = 0;
        d.current_price = 0.0;
        assert_eq!(score_deal(&d), 100.0);

        d.discount_percent = 0.0;
        d.rating = 0.0;
        d.sales_rank = 5_000_000;
        d.current_price = 2_000.0;
        assert_eq!(score_deal(&d), 0.0);
    }

    #[test]
    fn rank_and_price_terms_saturate() {
        let mut d = deal();
        d.sales_rank = 100_000;
        d.current_price = 500.0;
        // rank and price contribute nothing at their saturation points
        let base = score_deal(&d);
        d.sales_rank = 10_000_000;
        d.current_price = 9_999.0;
        assert_eq!(score_deal(&d), base);
    }

    #[test]
    fn spam_rules_each_reject_alone() {
        let ok = deal();
        assert!(is_valid_deal(&ok));

        let mut low_rating = deal();
        low_rating.rating = 3.2;
        assert!(!is_valid_deal(&low_rating));

        let mut cheap = deal();
        cheap.current_price = 9.99;
        assert!(!is_valid_deal(&cheap));

        let mut too_good = deal();
        too_good.discount_percent = 90.0;
        assert!(!is_valid_deal(&too_good));

        let mut dropship = deal();
        dropship.title = "Cheap Fast Shipping Dropship Keyboard".to_string();
        assert!(!is_valid_deal(&dropship));

        let mut untitled = deal();
        untitled.title = String::new();
        assert!(!is_valid_deal(&untitled));
    }

    #[test]
    fn boundary_values_pass() {
        let mut d = deal();
        d.rating = 3.5;
        d.current_price = 10.0;
        d.discount_percent = 80.0;
        assert!(is_valid_deal(&d));
    }
}
