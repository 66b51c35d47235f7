//! Label matching for the localized game UI.
//!
//! Everything that maps free text to a semantic identifier lives here so the
//! scheduling and caching code never sees a raw label.

use farmhand_protocol::{BuildingKind, ResourceKind};

/// What a label on the page refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Resource(ResourceKind),
    Building(BuildingKind),
    Unknown,
}

const RESOURCE_KEYWORDS: [(ResourceKind, &[&str]); 4] = [
    (ResourceKind::Wood, &["lena", "wood", "bosque"]),
    (ResourceKind::Clay, &["barr", "clay", "arcilla"]),
    (ResourceKind::Iron, &["hierro", "iron", "mina"]),
    (ResourceKind::Crop, &["granja", "crop", "cereal"]),
];

const STOP_WORDS: [&str; 12] = [
    "de", "del", "la", "el", "los", "las", "und", "der", "die", "das", "a", "to",
];

/// Lowercases, strips Latin diacritics and collapses whitespace.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if is_combining_mark(ch) {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(fold_char(ch));
    }
    out
}

fn is_combining_mark(ch: char) -> bool {
    ('\u{0300}'..='\u{036f}').contains(&ch)
}

fn fold_char(ch: char) -> char {
    match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'ď' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' => 'i',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => 'o',
        'ř' => 'r',
        'ś' | 'š' | 'ş' => 's',
        'ť' | 'ţ' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => 'u',
        'ý' | 'ÿ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        other => other,
    }
}

pub fn contains_any(normalized: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| normalized.contains(n))
}

pub fn building_keywords(kind: BuildingKind) -> &'static [&'static str] {
    match kind {
        BuildingKind::Barracks => &["cuartel", "cuarteles", "barracks"],
        BuildingKind::Stable => &["establo", "estable", "stable"],
        BuildingKind::Workshop => &["taller", "taller de asedio", "workshop"],
        BuildingKind::Residence => &["residencia", "palacio", "residence", "palace"],
        BuildingKind::RallyPoint => &[
            "plaza de reuniones",
            "plaza de reunion",
            "rally point",
            "assembly point",
        ],
    }
}

/// Numeric building ids used in `gid` links and `g<N>` classes.
pub fn building_gids(kind: BuildingKind) -> &'static [u32] {
    match kind {
        BuildingKind::Barracks => &[19],
        BuildingKind::Stable => &[20],
        BuildingKind::Workshop => &[21],
        BuildingKind::Residence => &[25, 26],
        BuildingKind::RallyPoint => &[16],
    }
}

/// Slots where the building usually sits, probed when the village view gives nothing.
pub fn fallback_slots(kind: BuildingKind) -> &'static [u32] {
    match kind {
        BuildingKind::Barracks => &[19, 18, 17, 16],
        BuildingKind::Stable => &[20, 21],
        BuildingKind::Workshop => &[21, 22, 23],
        BuildingKind::Residence => &[25, 26],
        BuildingKind::RallyPoint => &[],
    }
}

pub fn classify_resource(raw: &str) -> Option<ResourceKind> {
    let text = normalize(raw);
    RESOURCE_KEYWORDS
        .iter()
        .find(|(_, words)| contains_any(&text, words))
        .map(|(kind, _)| *kind)
}

pub fn classify_building(raw: &str) -> Option<BuildingKind> {
    let text = normalize(raw);
    [
        BuildingKind::Barracks,
        BuildingKind::Stable,
        BuildingKind::Workshop,
        BuildingKind::Residence,
        BuildingKind::RallyPoint,
    ]
    .into_iter()
    .find(|kind| contains_any(&text, building_keywords(*kind)))
}

/// Buildings are checked first: "barracks" would otherwise read as clay.
pub fn classify(raw: &str) -> Label {
    if let Some(kind) = classify_building(raw) {
        return Label::Building(kind);
    }
    match classify_resource(raw) {
        Some(kind) => Label::Resource(kind),
        None => Label::Unknown,
    }
}

/// Significant words of a unit name: stop-words and short words dropped.
pub fn name_tokens(normalized_name: &str) -> Vec<&str> {
    normalized_name
        .split(' ')
        .map(str::trim)
        .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t) && t.chars().count() >= 4)
        .collect()
}

/// Plural/singular tolerant containment of one token.
pub fn token_match(haystack: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    if haystack.contains(token)
        || haystack.contains(&format!("{token}s"))
        || haystack.contains(&format!("{token}es"))
    {
        return true;
    }
    let chars: Vec<char> = token.chars().collect();
    let n = chars.len();
    if n >= 5 && haystack.contains(&chars[..n - 1].iter().collect::<String>()) {
        return true;
    }
    if n >= 6 && haystack.contains(&chars[..n - 2].iter().collect::<String>()) {
        return true;
    }
    n >= 5 && haystack.contains(&chars[1..].iter().collect::<String>())
}

/// Whether a normalized line of text names the given unit.
pub fn matches_name(text: &str, normalized_name: &str) -> bool {
    if text.is_empty() || normalized_name.is_empty() {
        return false;
    }
    if text.contains(normalized_name) {
        return true;
    }
    let tokens = name_tokens(normalized_name);
    if tokens.is_empty() {
        return false;
    }
    let matched = tokens.iter().filter(|t| token_match(text, t)).count();
    matched == tokens.len()
}

/// Digits of the first number in `text`, ignoring `.`/`,` thousands separators.
pub fn parse_amount(text: &str) -> Option<u64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | ','))
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

pub fn first_number(text: &str) -> Option<u32> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    text[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_case_accents_and_space() {
        assert_eq!(normalize("  Leñador   Nivel 3 "), "lenador nivel 3");
        assert_eq!(normalize("Plaza de Reunión"), "plaza de reunion");
        assert_eq!(normalize("e\u{0301}tape"), "etape");
    }

    #[test]
    fn classifies_resource_fields() {
        assert_eq!(classify("Leñador"), Label::Resource(ResourceKind::Wood));
        assert_eq!(classify("Barrera"), Label::Resource(ResourceKind::Clay));
        assert_eq!(classify("Mina de hierro"), Label::Resource(ResourceKind::Iron));
        assert_eq!(classify("Granja"), Label::Resource(ResourceKind::Crop));
        assert_eq!(classify("Iron Mine"), Label::Resource(ResourceKind::Iron));
        assert_eq!(classify("Marketplace"), Label::Unknown);
    }

    #[test]
    fn buildings_win_over_resource_prefixes() {
        assert_eq!(classify("Barracks"), Label::Building(BuildingKind::Barracks));
        assert_eq!(classify("Cuartel"), Label::Building(BuildingKind::Barracks));
        assert_eq!(
            classify("Plaza de reuniones"),
            Label::Building(BuildingKind::RallyPoint)
        );
    }

    #[test]
    fn unit_names_match_plural_forms() {
        let target = normalize("Legionario");
        assert!(matches_name("12 legionarios 0:03:12", &target));
        let target = normalize("Equites Imperatoris");
        assert!(matches_name("equites imperatoris existente: 4", &target));
        assert!(!matches_name("pretorianos existente: 4", &target));
    }

    #[test]
    fn tokens_drop_stop_words() {
        assert_eq!(name_tokens("carnero de asalto"), vec!["carnero", "asalto"]);
    }

    #[test]
    fn amounts_ignore_separators() {
        assert_eq!(parse_amount("Madera 12.340"), Some(12_340));
        assert_eq!(parse_amount("1,250 / 8000"), Some(1_250));
        assert_eq!(parse_amount("none"), None);
        assert_eq!(first_number("Nivel 7"), Some(7));
    }
}
