//! Capture file-name grammar.
//!
//! ```text
//! name     := level "_" capture [ "_" marker ] "_" project "_" indices "_" session [ ext ]
//! level    := ALPHA ALNUM*
//! capture  := DIGIT+                 (normalized to an integer)
//! marker   := "test"                 (case-insensitive)
//! project  := (ALNUM | "-")+
//! indices  := DIGIT+ ( "_" DIGIT+ )*
//! session  := ALNUM+
//! ext      := ( "." ALNUM+ )+
//! ```
//!
//! `L1_00042_test_Orion_003_001_S7f3a.raw` is capture 42, a test capture of
//! project `Orion`.

use ferry_core::{CaptureKey, CaptureKind};
use once_cell::sync::Lazy;
use regex::Regex;

static CAPTURE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(?P<level>[A-Za-z][A-Za-z0-9]*)",
        r"_(?P<capture>[0-9]+)",
        r"(?:_(?P<marker>(?i:test)))?",
        r"_(?P<project>[A-Za-z0-9-]+)",
        r"_(?P<indices>[0-9]+(?:_[0-9]+)*)",
        r"_(?P<session>[A-Za-z0-9]+)",
        r"(?:\.[A-Za-z0-9]+)*$",
    ))
    .expect("capture name pattern is valid")
});

/// Fields pulled out of a matching file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureName {
    pub level: String,
    pub key: CaptureKey,
    pub kind: CaptureKind,
    pub project: String,
    pub session: String,
}

/// Parse `file_name` (final path component only).
///
/// Returns `None` for names outside the grammar and for capture numbers too
/// large for a `u64`.
pub fn parse_capture_name(file_name: &str) -> Option<CaptureName> {
    let caps = CAPTURE_NAME.captures(file_name)?;
    let key: CaptureKey = caps.name("capture")?.as_str().parse().ok()?;
    let kind = if caps.name("marker").is_some() {
        CaptureKind::Test
    } else {
        CaptureKind::Production
    };
    Some(CaptureName {
        level: caps["level"].to_string(),
        key,
        kind,
        project: caps["project"].to_string(),
        session: caps["session"].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_documented_example() {
        let name = parse_capture_name("L1_00042_test_Orion_003_001_S7f3a.raw").unwrap();
        assert_eq!(name.level, "L1");
        assert_eq!(name.key, CaptureKey(42));
        assert_eq!(name.kind, CaptureKind::Test);
        assert_eq!(name.project, "Orion");
        assert_eq!(name.session, "S7f3a");
    }

    #[rstest]
    #[case("L1_42_Orion_3_S1.raw", 42, CaptureKind::Production)]
    #[case("L2_0007_TEST_my-proj_1_2_3_abc", 7, CaptureKind::Test)]
    #[case("Raw_100_Orion_01_ZZ.tar.gz", 100, CaptureKind::Production)]
    fn accepts_valid_names(#[case] input: &str, #[case] id: u64, #[case] kind: CaptureKind) {
        let name = parse_capture_name(input).unwrap();
        assert_eq!(name.key, CaptureKey(id));
        assert_eq!(name.kind, kind);
    }

    #[rstest]
    #[case::no_level("_42_Orion_3_S1.raw")]
    #[case::level_starts_with_digit("1L_42_Orion_3_S1.raw")]
    #[case::missing_indices("L1_42_Orion_S1.raw")]
    #[case::non_numeric_capture("L1_x42_Orion_3_S1")]
    #[case::trailing_dot("L1_42_Orion_3_S1.")]
    #[case::overflowing_capture("L1_99999999999999999999999_Orion_3_S1")]
    #[case::plain_file("notes.txt")]
    fn rejects_invalid_names(#[case] input: &str) {
        assert!(parse_capture_name(input).is_none(), "{input} should not parse");
    }

    #[test]
    fn leading_zeros_do_not_matter() {
        let a = parse_capture_name("L1_00042_Orion_1_S").unwrap();
        let b = parse_capture_name("L1_42_Orion_1_S").unwrap();
        assert_eq!(a.key, b.key);
    }
}
