//! # Engine Primitives
//!
//! Fixed constants shared by the identity model, the stores and the wire
//! formats. Changing any of these changes persisted keys.

/// Delimiter framing the sections of an identifier stem.
///
/// `#<graph_type>#<object_type>#<json properties>#`
pub const STEM_DELIMITER: char = '#';

/// Suffix marking a stem whose identity is not yet confirmed.
pub const STUB_SUFFIX: &str = "::stub";

/// Text form of a missing value in identity strings and rendered keys.
pub const MISSING_TOKEN: &str = "#missing#";

/// Hashed in place of a missing identity component.
///
/// This is how stub vertices obtain a stable id before real data arrives.
pub const ID_TAG_MISSING: u8 = 0x00;

/// Leads a known identity component, which follows as its length and text.
pub const ID_TAG_VALUE: u8 = 0x01;

/// Length of an internal id in hex characters (128 bits of BLAKE3 output).
pub const INTERNAL_ID_LEN: usize = 32;

/// Prefix of the reference token that replaces a redacted property value.
pub const SECRET_TOKEN_PREFIX: &str = "secret::";

/// Wildcard accepted in edge endpoint allow-lists.
pub const ENDPOINT_WILDCARD: &str = "*";

/// Prefix of a rule or key expression that reads from the source vertex.
pub const SOURCE_REF_PREFIX: &str = "source.";

/// Prefix of an edge id-key expression that reads from the `from` vertex.
pub const FROM_REF_PREFIX: &str = "from.";

/// Prefix of an edge id-key expression that reads from the `to` vertex.
pub const TO_REF_PREFIX: &str = "to.";

/// Pseudo-field naming an endpoint's internal id in `from.`/`to.` references.
pub const INTERNAL_ID_FIELD: &str = "internal_id";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_tags_are_distinct() {
        assert_ne!(ID_TAG_MISSING, ID_TAG_VALUE);
    }

    #[test]
    fn internal_id_fits_blake3_output() {
        assert!(INTERNAL_ID_LEN <= blake3::OUT_LEN * 2);
    }
}
