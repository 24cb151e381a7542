//! Address canonicalisation and token-aware similarity.

use std::collections::BTreeSet;

use crate::{compact_postcode, format_postcode};

/// Street-suffix and building abbreviations folded to one spelling before comparison.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("RD", "ROAD"),
    ("ST", "STREET"),
    ("STR", "STREET"),
    ("AVE", "AVENUE"),
    ("AV", "AVENUE"),
    ("LN", "LANE"),
    ("DR", "DRIVE"),
    ("CT", "COURT"),
    ("CL", "CLOSE"),
    ("CRES", "CRESCENT"),
    ("CRESC", "CRESCENT"),
    ("GDNS", "GARDENS"),
    ("GRN", "GREEN"),
    ("GRO", "GROVE"),
    ("PL", "PLACE"),
    ("SQ", "SQUARE"),
    ("TER", "TERRACE"),
    ("TERR", "TERRACE"),
    ("PK", "PARK"),
    ("PDE", "PARADE"),
    ("HSE", "HOUSE"),
    ("APT", "APARTMENT"),
    ("APTS", "APARTMENTS"),
    ("FLT", "FLAT"),
    ("BLDG", "BUILDING"),
    ("MT", "MOUNT"),
    ("HTS", "HEIGHTS"),
    ("EST", "ESTATE"),
];

fn expand(token: &str) -> &str {
    ABBREVIATIONS
        .iter()
        .find(|(short, _)| *short == token)
        .map(|(_, long)| *long)
        .unwrap_or(token)
}

/// Canonical comparable form of a free-text address.
///
/// Uppercases, replaces punctuation with whitespace, folds abbreviations and,
/// when a postcode is supplied, removes any copy of it from the text and
/// appends it in canonical `OUTWARD INWARD` form as the final tokens. Never
/// fails: input with no alphanumeric content yields the postcode alone or an
/// empty string.
pub fn normalize(address: &str, postcode: Option<&str>) -> String {
    let upper = address.to_uppercase();
    let cleaned = upper
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    let mut tokens = cleaned
        .split_whitespace()
        .map(|t| expand(t).to_string())
        .collect::<Vec<_>>();

    let compact = postcode.map(compact_postcode).filter(|p| !p.is_empty());
    if let Some(compact) = &compact {
        tokens = strip_postcode_tokens(tokens, compact);
        tokens.push(format_postcode(compact));
    }

    tokens.join(" ")
}

fn strip_postcode_tokens(tokens: Vec<String>, compact: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == compact {
            i += 1;
            continue;
        }
        if i + 1 < tokens.len() && format!("{}{}", tokens[i], tokens[i + 1]) == compact {
            i += 2;
            continue;
        }
        out.push(tokens[i].clone());
        i += 1;
    }
    out
}

/// Token-alignment similarity on a 0..=100 scale, rounded to two decimals.
///
/// Each side's distinct tokens are scored against the other side: a token
/// present on both sides earns full credit, any other token earns its best
/// normalised Levenshtein ratio against the opposite tokens. The score is the
/// better of the two per-side averages, so a flat number or locality present
/// on only one side does not count against the other. Symmetric and
/// reflexive, and never lowered by a token that both sides come to share.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 100.0;
    }

    let left: BTreeSet<&str> = a.split_whitespace().collect();
    let right: BTreeSet<&str> = b.split_whitespace().collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let best = coverage(&left, &right).max(coverage(&right, &left));
    round2((best * 100.0).clamp(0.0, 100.0))
}

/// Mean best-match credit of `tokens` against `against`, in 0..=1.
fn coverage(tokens: &BTreeSet<&str>, against: &BTreeSet<&str>) -> f64 {
    let credit = tokens
        .iter()
        .map(|token| {
            if against.contains(token) {
                1.0
            } else {
                against
                    .iter()
                    .map(|other| strsim::normalized_levenshtein(token, other))
                    .fold(0.0, f64::max)
            }
        })
        .sum::<f64>();
    credit / tokens.len() as f64
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_case_punctuation_and_abbreviations() {
        assert_eq!(
            normalize("  123, High St.;  london ", None),
            "123 HIGH STREET LONDON"
        );
        assert_eq!(normalize("Flat 2, 4 Mill Rd", None), "FLAT 2 4 MILL ROAD");
    }

    #[test]
    fn normalize_appends_postcode_once_at_the_end() {
        assert_eq!(
            normalize("123 High Street, SW1A 1AA, London", Some("sw1a1aa")),
            "123 HIGH STREET LONDON SW1A 1AA"
        );
        assert_eq!(
            normalize("123 High Street SW1A1AA", Some("SW1A 1AA")),
            "123 HIGH STREET SW1A 1AA"
        );
    }

    #[test]
    fn normalize_is_total_on_garbage() {
        assert_eq!(normalize("", None), "");
        assert_eq!(normalize("!!! ,,, ---", None), "");
        assert_eq!(normalize("***", Some("E1 6AN")), "E1 6AN");
        assert_eq!(normalize("ok", Some("   ")), "OK");
    }

    #[test]
    fn similarity_is_reflexive_and_symmetric() {
        let samples = [
            "",
            "123 HIGH STREET LONDON SW1A 1AA",
            "FLAT 2 123 HIGH STREET LONDON",
            "7 ACACIA AVENUE",
            "ROSE COTTAGE MILL LANE",
        ];
        for a in samples {
            assert_eq!(similarity(a, a), 100.0);
            for b in samples {
                assert_eq!(similarity(a, b), similarity(b, a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn similarity_stays_in_range() {
        let score = similarity("1 A", "ZZZZZZZZZZZZZZ QQQQ");
        assert!((0.0..=100.0).contains(&score));
        assert_eq!(similarity("", "ANYTHING"), 0.0);
    }

    const VOCABULARY: &[&str] = &[
        "1", "2", "12", "123", "A", "FLAT", "ROSE", "HIGH", "STREET", "LANE", "ROAD", "MILL",
        "LONDON", "LEEDS", "SW1A", "1AA", "2AA",
    ];

    /// Small deterministic generator so every run sees the same address pairs.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: usize) -> usize {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 33) % bound as u64) as usize
        }

        fn address(&mut self) -> String {
            let len = 1 + self.next(6);
            (0..len)
                .map(|_| VOCABULARY[self.next(VOCABULARY.len())])
                .collect::<Vec<_>>()
                .join(" ")
        }
    }

    #[test]
    fn shared_tokens_never_lower_the_score() {
        assert_eq!(similarity("123 HIGH STREET", "123 HIGH STREET LONDON"), 100.0);

        let before = similarity("STREET 1 LANE LONDON 1", "A ROSE STREET ROSE LONDON");
        let after = similarity("STREET 1 LANE LONDON 1 1", "A ROSE STREET ROSE LONDON 1");
        assert!(after >= before, "{after} < {before}");

        let mut rng = Lcg(0x5eed);
        for _ in 0..2_000 {
            let a = rng.address();
            let b = rng.address();
            let shared = VOCABULARY[rng.next(VOCABULARY.len())];
            let base = similarity(&a, &b);
            let widened = similarity(&format!("{a} {shared}"), &format!("{b} {shared}"));
            assert!(widened >= base, "{a:?} / {b:?} + {shared}: {widened} < {base}");
            assert_eq!(base, similarity(&b, &a), "{a:?} vs {b:?}");
            assert!((0.0..=100.0).contains(&base));
        }
    }

    #[test]
    fn near_miss_postcode_costs_part_of_one_token() {
        let score = similarity(
            "123 HIGH STREET LONDON SW1A 2AA",
            "123 HIGH STREET LONDON SW1A 1AA",
        );
        // Five exact tokens plus 2AA/1AA at two thirds, over six tokens.
        assert_eq!(score, 94.44);
    }

    #[test]
    fn different_houses_score_below_same_house() {
        let same = similarity(
            &normalize("123 High Street, London", Some("SW1A 1AA")),
            &normalize("123, High Street, London", Some("SW1A 1AA")),
        );
        let other = similarity(
            &normalize("9 Station Road, Leeds", Some("LS1 4AP")),
            &normalize("123, High Street, London", Some("SW1A 1AA")),
        );
        assert_eq!(same, 100.0);
        assert!(other < 80.0);
    }
}
