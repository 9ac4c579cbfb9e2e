//! Plate normalization: raw OCR text to canonical plate string.
//!
//! A canonical plate has eight characters: letters at positions 0, 1, 2, 6
//! and 7, digits at positions 3, 4 and 5. OCR confuses a handful of glyphs
//! (`O`/`0`, `I`/`1`, `J`/`3`, `A`/`4`, `G`/`6`, `S`/`5`); each position is
//! corrected towards its expected class. Length is never changed.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

/// Length of a canonical plate.
pub const PLATE_LEN: usize = 8;

/// Characters removed from OCR candidates before testing them.
pub const UNWANTED_CHARS: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~ ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Letter,
    Digit,
}

const LAYOUT: [Class; PLATE_LEN] = [
    Class::Letter,
    Class::Letter,
    Class::Letter,
    Class::Digit,
    Class::Digit,
    Class::Digit,
    Class::Letter,
    Class::Letter,
];

#[allow(clippy::expect_used)]
static LETTER_DIGIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z]\d").expect("letter-digit pattern is valid"));

const fn to_letter(c: char) -> char {
    match c {
        '0' => 'O',
        '1' => 'I',
        '3' => 'J',
        '4' => 'A',
        '6' => 'G',
        '5' => 'S',
        other => other,
    }
}

const fn to_digit(c: char) -> char {
    match c {
        'O' => '0',
        'I' => '1',
        'J' => '3',
        'A' => '4',
        'G' => '6',
        'S' => '5',
        other => other,
    }
}

/// Correct look-alike glyphs per position.
///
/// Returns `None` unless `text` is exactly [`PLATE_LEN`] characters. Input is
/// uppercased character by character, so the output always has the same
/// length as the input.
pub fn normalize(text: &str) -> Option<String> {
    if text.chars().count() != PLATE_LEN {
        return None;
    }
    Some(
        text.chars()
            .zip(LAYOUT)
            .map(|(c, class)| {
                let c = c.to_ascii_uppercase();
                match class {
                    Class::Letter => to_letter(c),
                    Class::Digit => to_digit(c),
                }
            })
            .collect(),
    )
}

/// Remove [`UNWANTED_CHARS`] from a candidate.
pub fn strip_unwanted(text: &str) -> String {
    text.chars().filter(|c| !UNWANTED_CHARS.contains(*c)).collect()
}

/// Cheap plausibility filter: contains a letter immediately followed by a
/// digit.
pub fn is_plausible(text: &str) -> bool {
    LETTER_DIGIT.is_match(text)
}

/// Pick the first OCR candidate that yields a canonical plate.
///
/// Candidates are scanned in order. Each is stripped, filtered with
/// [`is_plausible`] and normalized; a candidate that passes the filter but
/// has the wrong length is skipped and the scan continues.
pub fn select_plate<I, S>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for candidate in candidates {
        let cleaned = strip_unwanted(candidate.as_ref());
        if !is_plausible(&cleaned) {
            continue;
        }
        if let Some(plate) = normalize(&cleaned) {
            return Some(plate);
        }
        debug!(candidate = %cleaned, "Plausible candidate has wrong length");
    }
    None
}
