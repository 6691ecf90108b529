use keeper_core::models::{PriceAlert, WatchedProduct};

pub fn html_escape(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '&' => "&amp;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#x27;".to_string(),
            _ => c.to_string(),
        })
        .collect()
}

pub struct FormattedAlert {
    pub subject: String,
    pub body: String,
}

/// Per-channel alert formatting. Email gets an HTML-ish body, the
/// messaging channel a compact Markdown message, webhooks a plain line
/// (the structured payload travels separately).
pub fn format_price_alert(
    channel: &str,
    product_name: &str,
    current_price: f64,
    target_price: f64,
    url: &str,
) -> FormattedAlert {
    let savings = target_price - current_price;
    match channel {
        "telegram" => FormattedAlert {
            subject: "Price Drop Alert".to_string(),
            body: format!(
                "*Price Drop Detected!*\n\n*{}*\n{:.2}€ (target {:.2}€)\nSavings: {:.2}€\n\n[Buy on Amazon]({})",
                product_name, current_price, target_price, savings, url
            ),
        },
        "webhook" => FormattedAlert {
            subject: "Price Alert".to_string(),
            body: format!(
                "Price drop: {} now {:.2}€ (target {:.2}€): {}",
                product_name, current_price, target_price, url
            ),
        },
        _ => FormattedAlert {
            subject: format!("Price Drop Alert: {}", product_name),
            body: format!(
                "<p>The product you are watching dropped in price.</p>\
                 <p><b>{}</b><br>\
                 Current price: {:.2}€<br>\
                 Your target: {:.2}€<br>\
                 Savings: {:.2}€</p>\
                 <p><a href=\"{}\">Buy now on Amazon</a></p>",
                html_escape(product_name),
                current_price,
                target_price,
                savings,
                html_escape(url)
            ),
        },
    }
}

/// Single digest message sent instead of individual alerts once a user
/// crosses the hourly cap.
pub fn format_digest(alerts: &[(PriceAlert, WatchedProduct)]) -> FormattedAlert {
    let mut lines = String::new();
    for (alert, watch) in alerts {
        let name = watch.product_name.as_deref().unwrap_or(&watch.asin);
        lines.push_str(&format!(
            "<li>{}: {:.2}€ (target {:.2}€)</li>",
            html_escape(name),
            alert.triggered_price,
            alert.target_price
        ));
    }

    FormattedAlert {
        subject: format!("Price Alert Digest: {} products crossed their targets", alerts.len()),
        body: format!(
            "<p>You hit the hourly alert limit, so here is everything in one message:</p>\
             <ul>{}</ul>",
            lines
        ),
    }
}

/// HTML table for the daily deal report email.
pub fn format_deal_report_html(
    deals: &[serde_json::Value],
    filter_name: &str,
    filter_summary: &str,
) -> String {
    let mut rows = String::new();
    for (i, deal) in deals.iter().enumerate() {
        let title = deal.get("title").and_then(|v| v.as_str()).unwrap_or("Unknown");
        let url = deal.get("url").and_then(|v| v.as_str()).unwrap_or("#");
        let price = deal.get("current_price").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let discount = deal.get("discount_percent").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let rating = deal.get("rating").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let reviews = deal.get("reviews").and_then(|v| v.as_i64()).unwrap_or(0);

        rows.push_str(&format!(
            "<tr><td>{}</td>\
             <td><a href=\"{}\">{}</a><br>{:.1}/5 ({} reviews)</td>\
             <td>{:.2}€</td>\
             <td style=\"color:red;font-weight:bold\">-{:.1}%</td></tr>",
            i + 1,
            html_escape(url),
            html_escape(title),
            rating,
            reviews,
            price,
            discount
        ));
    }

    format!(
        "<html><body style=\"font-family:Arial,sans-serif;padding:20px\">\
         <h2>{}</h2><p>{}</p>\
         <table border=\"1\" cellpadding=\"8\" cellspacing=\"0\" width=\"100%\">\
         <tr><th>#</th><th>Product</th><th>Price</th><th>Discount</th></tr>\
         {}\
         </table></body></html>",
        html_escape(filter_name),
        html_escape(filter_summary),
        rows
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn escaping_covers_markup_characters() {
        assert_eq!(
            html_escape("<b>\"K&R\"</b>'s"),
            "&lt;b&gt;&quot;K&amp;R&quot;&lt;/b&gt;&#x27;s"
        );
    }

    #[test]
    fn email_alert_carries_prices_and_link() {
        let formatted =
            format_price_alert("email", "Logitech K380", 44.99, 45.0, "https://amazon.de/dp/B07W6JN8V8");
        assert!(formatted.subject.contains("Logitech K380"));
        assert!(formatted.body.contains("44.99"));
        assert!(formatted.body.contains("45.00"));
        assert!(formatted.body.contains("https://amazon.de/dp/B07W6JN8V8"));
    }

    #[test]
    fn telegram_alert_is_markdown() {
        let formatted =
            format_price_alert("telegram", "Cherry KC 1000", 18.99, 20.0, "https://amazon.de/dp/B0058UR5GS");
        assert!(formatted.body.starts_with("*Price Drop Detected!*"));
        assert!(formatted.body.contains("[Buy on Amazon]"));
    }

    #[test]
    fn digest_lists_every_queued_alert() {
        let watch = WatchedProduct {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            asin: "B07W6JN8V8".to_string(),
            product_name: Some("Logitech K380".to_string()),
            target_price: 45.0,
            current_price: Some(44.99),
            volatility_score: 0.0,
            status: "ACTIVE".to_string(),
            last_checked_at: None,
            last_price_change: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let alert = PriceAlert {
            id: Uuid::new_v4(),
            watch_id: watch.id,
            triggered_price: 44.99,
            target_price: 45.0,
            old_price: Some(55.0),
            new_price: Some(44.99),
            discount_percent: Some(18.2),
            status: "PENDING".to_string(),
            notification_channel: None,
            triggered_at: Utc::now(),
            sent_at: None,
        };

        let digest = format_digest(&[(alert.clone(), watch.clone()), (alert, watch)]);
        assert!(digest.subject.contains("2 products"));
        assert_eq!(digest.body.matches("<li>").count(), 2);
    }

    #[test]
    fn report_renders_one_row_per_deal() {
        let deals = vec![
            serde_json::json!({"title": "K380", "url": "https://amazon.de/dp/a", "current_price": 44.99, "discount_percent": 25.0, "rating": 4.5, "reviews": 834}),
            serde_json::json!({"title": "KC 1000", "url": "https://amazon.de/dp/b", "current_price": 18.99, "discount_percent": 12.0, "rating": 4.2, "reviews": 120}),
        ];
        let html = format_deal_report_html(&deals, "QWERTZ Deals", "Discount: 10-80%");
        assert_eq!(html.matches("<tr><td>").count(), 2);
        assert!(html.contains("QWERTZ Deals"));
        assert!(html.contains("-25.0%"));
    }
}
