//! ISRC normalization and validation
//!
//! An International Standard Recording Code is 12 characters: a two-letter
//! ISO-3166 country code, a three-character registrant code, a two-digit
//! reference year and a five-digit designation code. Codes arrive from
//! providers in mixed case and with optional dashes ("FR-Z03-14-00123");
//! they are stored normalized (uppercase, no separators) so the unique
//! index on `tracks.isrc` can do its deduplication job.

use crate::{Error, Result};

/// ISO-3166 alpha-2 country codes, sorted for binary search.
const ISO_3166_ALPHA2: &[&str] = &[
    "AD", "AE", "AF", "AG", "AI", "AL", "AM", "AO", "AQ", "AR", "AS", "AT", "AU", "AW", "AX",
    "AZ", "BA", "BB", "BD", "BE", "BF", "BG", "BH", "BI", "BJ", "BL", "BM", "BN", "BO", "BQ",
    "BR", "BS", "BT", "BV", "BW", "BY", "BZ", "CA", "CC", "CD", "CF", "CG", "CH", "CI", "CK",
    "CL", "CM", "CN", "CO", "CR", "CU", "CV", "CW", "CX", "CY", "CZ", "DE", "DJ", "DK", "DM",
    "DO", "DZ", "EC", "EE", "EG", "EH", "ER", "ES", "ET", "FI", "FJ", "FK", "FM", "FO", "FR",
    "GA", "GB", "GD", "GE", "GF", "GG", "GH", "GI", "GL", "GM", "GN", "GP", "GQ", "GR", "GS",
    "GT", "GU", "GW", "GY", "HK", "HM", "HN", "HR", "HT", "HU", "ID", "IE", "IL", "IM", "IN",
    "IO", "IQ", "IR", "IS", "IT", "JE", "JM", "JO", "JP", "KE", "KG", "KH", "KI", "KM", "KN",
    "KP", "KR", "KW", "KY", "KZ", "LA", "LB", "LC", "LI", "LK", "LR", "LS", "LT", "LU", "LV",
    "LY", "MA", "MC", "MD", "ME", "MF", "MG", "MH", "MK", "ML", "MM", "MN", "MO", "MP", "MQ",
    "MR", "MS", "MT", "MU", "MV", "MW", "MX", "MY", "MZ", "NA", "NC", "NE", "NF", "NG", "NI",
    "NL", "NO", "NP", "NR", "NU", "NZ", "OM", "PA", "PE", "PF", "PG", "PH", "PK", "PL", "PM",
    "PN", "PR", "PS", "PT", "PW", "PY", "QA", "RE", "RO", "RS", "RU", "RW", "SA", "SB", "SC",
    "SD", "SE", "SG", "SH", "SI", "SJ", "SK", "SL", "SM", "SN", "SO", "SR", "SS", "ST", "SV",
    "SX", "SY", "SZ", "TC", "TD", "TF", "TG", "TH", "TJ", "TK", "TL", "TM", "TN", "TO", "TR",
    "TT", "TV", "TW", "TZ", "UA", "UG", "UM", "US", "UY", "UZ", "VA", "VC", "VE", "VG", "VI",
    "VN", "VU", "WF", "WS", "YE", "YT", "ZA", "ZM", "ZW",
];

/// Strip dashes and spaces and uppercase the remainder.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '-' && *c != ' ')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// True when `isrc` (already normalized) has a valid shape and country code.
pub fn is_valid(isrc: &str) -> bool {
    if isrc.len() != 12 || !isrc.is_ascii() {
        return false;
    }
    let bytes = isrc.as_bytes();

    // CC: two uppercase letters, in the ISO-3166 set
    if !bytes[..2].iter().all(u8::is_ascii_uppercase) {
        return false;
    }
    if ISO_3166_ALPHA2.binary_search(&&isrc[..2]).is_err() {
        return false;
    }
    // XXX: registrant, alphanumeric uppercase
    if !bytes[2..5]
        .iter()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
    {
        return false;
    }
    // YYNNNNN: year + designation, all digits
    bytes[5..].iter().all(u8::is_ascii_digit)
}

/// Normalize and validate in one step.
///
/// Returns the normalized code, or [`Error::InvalidIsrc`] carrying the
/// raw input for the caller's log line — an invalid ISRC must never
/// reach a Track row.
pub fn parse(raw: &str) -> Result<String> {
    let normalized = normalize(raw);
    if is_valid(&normalized) {
        Ok(normalized)
    } else {
        Err(Error::InvalidIsrc(raw.to_string()))
    }
}

/// [`parse`] for callers that only care whether a code survived.
pub fn normalize_valid(raw: &str) -> Option<String> {
    parse(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_isrc() {
        assert!(is_valid("FRZ031400123"));
        assert!(is_valid("USRC17607839"));
        assert!(is_valid("GBAYE0601498"));
    }

    #[test]
    fn test_normalize_strips_separators_and_uppercases() {
        assert_eq!(normalize("fr-z03-14-00123"), "FRZ031400123");
        assert_eq!(normalize("US RC1 7607839"), "USRC17607839");
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        assert!(!is_valid("INVALID"));
        assert!(!is_valid("FRZ03140012")); // 11 chars
        assert!(!is_valid("FRZ0314001234")); // 13 chars
        assert!(!is_valid("FRZ03X400123")); // letter in year/designation
        assert!(!is_valid("frz031400123")); // lowercase
    }

    #[test]
    fn test_unknown_country_code_rejected() {
        // XX is not an ISO-3166 country
        assert!(!is_valid("XXZ031400123"));
    }

    #[test]
    fn test_normalize_valid_round_trip() {
        assert_eq!(
            normalize_valid("FR-Z03-14-00123").as_deref(),
            Some("FRZ031400123")
        );
        assert_eq!(normalize_valid("not an isrc"), None);
    }

    #[test]
    fn test_parse_error_names_the_raw_code() {
        let err = parse("QQ-BAD-00-0000!").unwrap_err();
        assert!(matches!(err, Error::InvalidIsrc(_)));
        assert!(err.to_string().contains("QQ-BAD-00-0000!"));
    }

    #[test]
    fn test_country_table_is_sorted() {
        let mut sorted = ISO_3166_ALPHA2.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, ISO_3166_ALPHA2);
    }
}
