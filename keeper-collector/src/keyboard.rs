//! Keyboard-domain predicates and layout annotation. The upstream category
//! filter is too broad (it returns general computer accessories), so deals
//! are post-filtered on title keywords and known keyboard brands.

const TITLE_KEYWORDS: [&str; 18] = [
    "tastatur",
    "keyboard",
    "clavier",
    "tastiera",
    "teclado",
    "qwertz",
    "qwerty",
    "azerty",
    "mechanisch",
    "mechanical",
    "mecanique",
    "meccanica",
    "mecanico",
    "keycap",
    "cherry mx",
    "gateron",
    "kailh",
    "hotswap",
];

const BRAND_WHITELIST: [&str; 28] = [
    "logitech",
    "cherry",
    "corsair",
    "razer",
    "steelseries",
    "hyperx",
    "keychron",
    "ducky",
    "leopold",
    "varmilo",
    "das keyboard",
    "filco",
    "hhkb",
    "realforce",
    "roccat",
    "asus",
    "msi",
    "microsoft",
    "hama",
    "perixx",
    "glorious",
    "wooting",
    "nuphy",
    "akko",
    "epomaker",
    "royal kludge",
    "redragon",
    "havit",
];

/// Keep an item when its title carries a keyboard keyword or a whitelisted
/// brand.
pub fn matches_keyboard_domain(title: &str) -> bool {
    let title = title.to_lowercase();
    TITLE_KEYWORDS.iter().any(|kw| title.contains(kw))
        || BRAND_WHITELIST.iter().any(|brand| title.contains(brand))
}

/// Explicit layout signal in the title, if any.
fn layout_from_title(title: &str) -> Option<&'static str> {
    let title = title.to_lowercase();
    if title.contains("qwertz") {
        return Some("QWERTZ");
    }
    if title.contains("azerty") {
        return Some("AZERTY");
    }
    if title.contains("qwerty-it") || title.contains("tastiera italiana") || title.contains("italian layout") {
        return Some("QWERTY-IT");
    }
    if title.contains("uk layout") || title.contains("qwerty uk") {
        return Some("QWERTY-UK");
    }
    if title.contains("teclado espanol") || title.contains("spanish layout") {
        return Some("QWERTY-ES");
    }
    None
}

fn layout_for_market(market: &str) -> &'static str {
    match market {
        "DE" => "QWERTZ",
        "FR" => "AZERTY",
        "IT" => "QWERTY-IT",
        "UK" => "QWERTY-UK",
        "ES" => "QWERTY-ES",
        _ => "QWERTY",
    }
}

/// Layout annotation: an explicit title signal wins, otherwise the market's
/// expected layout is assumed.
pub fn annotate_layout(title: &str, market: &str) -> String {
    layout_from_title(title)
        .unwrap_or_else(|| layout_for_market(market))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_titles_match_across_languages() {
        assert!(matches_keyboard_domain("Logitech K380 Bluetooth Tastatur"));
        assert!(matches_keyboard_domain("Mechanical Gaming Keyboard RGB"));
        assert!(matches_keyboard_domain("Clavier sans fil AZERTY"));
        assert!(matches_keyboard_domain("Tastiera meccanica retroilluminata"));
        assert!(matches_keyboard_domain("Teclado inalambrico compacto"));
    }

    #[test]
    fn whitelisted_brand_is_enough_without_keywords() {
        assert!(matches_keyboard_domain("Keychron K2 Pro Hot-Swappable"));
        assert!(matches_keyboard_domain("Ducky One 3 Daybreak"));
    }

    #[test]
    fn unrelated_items_are_rejected() {
        assert!(!matches_keyboard_domain("USB-C Ladekabel 2m"));
        assert!(!matches_keyboard_domain("Gaming Maus 16000 DPI"));
    }

    #[test]
    fn explicit_layout_signal_beats_the_market() {
        assert_eq!(annotate_layout("Logitech K380 QWERTZ", "FR"), "QWERTZ");
        assert_eq!(annotate_layout("Clavier AZERTY rétroéclairé", "DE"), "AZERTY");
        assert_eq!(annotate_layout("Tastiera italiana slim", "DE"), "QWERTY-IT");
    }

    #[test]
    fn market_default_fills_in_when_the_title_is_silent() {
        assert_eq!(annotate_layout("Logitech K380", "DE"), "QWERTZ");
        assert_eq!(annotate_layout("Logitech K380", "FR"), "AZERTY");
        assert_eq!(annotate_layout("Logitech K380", "IT"), "QWERTY-IT");
        assert_eq!(annotate_layout("Logitech K380", "UK"), "QWERTY-UK");
        assert_eq!(annotate_layout("Logitech K380", "ES"), "QWERTY-ES");
        assert_eq!(annotate_layout("Logitech K380", "US"), "QWERTY");
    }
}
