//! Cell and name normalisation.

// ── Amounts ───────────────────────────────────────────────────────────────────

/// Parse an Indonesian-formatted amount.
/// "1.234.567" → 1234567 | "1.234,56" → 1234.56 | "(1.234)" → -1234 | "-" → None
pub fn parse_amount(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s == "-" || s == "—" || s.eq_ignore_ascii_case("N/A") {
        return None;
    }

    let (negative, body) = match s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        Some(inner) => (true, inner.trim()),
        None => match s.strip_prefix('-') {
            Some(rest) => (true, rest.trim()),
            None => (false, s),
        },
    };

    let body: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return None;
    }

    // Dots group thousands; a comma is the decimal separator.
    let normalised = match body.rsplit_once(',') {
        Some((whole, frac)) => format!("{}.{}", whole.replace(['.', ','], ""), frac),
        None if body.matches('.').count() == 1 && !is_thousands_grouped(&body) => body,
        None => body.replace('.', ""),
    };

    let value: f64 = normalised.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// A single dot followed by exactly three digits reads as a thousands group.
fn is_thousands_grouped(s: &str) -> bool {
    match s.split_once('.') {
        Some((head, tail)) => !head.is_empty() && tail.len() == 3,
        None => false,
    }
}

// ── Names ─────────────────────────────────────────────────────────────────────

/// Trim and collapse internal whitespace; case is kept as given.
pub fn normalise_entity(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

const BANK_PREFIXES: [&[&str]; 4] = [&["BPRS"], &["BPR"], &["PT", "BANK"], &["BANK"]];

/// Drop one leading `BPRS` / `BPR` / `PT BANK` / `BANK` for matching.
pub fn strip_bank_prefix(name: &str) -> String {
    let words: Vec<&str> = name.split_whitespace().collect();
    for prefix in BANK_PREFIXES {
        if words.len() > prefix.len()
            && prefix
                .iter()
                .zip(&words)
                .all(|(p, w)| w.eq_ignore_ascii_case(p))
        {
            return words[prefix.len()..].join(" ");
        }
    }
    words.join(" ")
}

/// Every offered bank whose stripped name matches the stripped request:
/// exact, contained, containing, or sharing all of the request's words.
pub fn fuzzy_match_bank<'a>(wanted: &str, offered: &'a [String]) -> Vec<&'a String> {
    let needle = strip_bank_prefix(wanted).to_uppercase();
    if needle.is_empty() {
        return Vec::new();
    }
    let needle_words: Vec<&str> = needle.split_whitespace().collect();

    offered
        .iter()
        .filter(|bank| {
            let hay = strip_bank_prefix(bank).to_uppercase();
            if hay.is_empty() {
                return false;
            }
            let hay_words: Vec<&str> = hay.split_whitespace().collect();
            hay == needle
                || hay.contains(&needle)
                || needle.contains(&hay)
                || needle_words.iter().all(|w| hay_words.contains(w))
        })
        .collect()
}

const TREE_LABELS: [&str; 7] = [
    "Laporan Posisi Keuangan",
    "Laporan Laba Rugi",
    "Laporan",
    "Posisi",
    "Keuangan",
    "Laba",
    "Rugi",
];

/// Whether a bank-tree caption names a bank rather than a report group.
/// Bank captions carry a code or are reasonably long.
pub fn looks_like_bank_option(caption: &str, extra_labels: &[&str]) -> bool {
    let caption = caption.trim();
    if caption.is_empty() {
        return false;
    }
    let lower = caption.to_lowercase();
    if TREE_LABELS
        .iter()
        .chain(extra_labels)
        .any(|label| lower.contains(&label.to_lowercase()))
    {
        return false;
    }
    caption.chars().any(|c| c.is_ascii_digit()) || caption.chars().count() > 15
}

// ── Tests ─────────────────────────────────────────────────────────────────────
