use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Relational row ids are SQLite integer primary keys; each table gets its
/// own newtype so a view id can never be passed where a sketch id is expected.
macro_rules! row_id {
    ($name:ident, $label:expr) => {
        #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn from_raw(raw: i64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> i64 {
                self.0
            }

            pub const fn label() -> &'static str {
                $label
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<i64>().map(Self)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

row_id!(SketchId, "sketch");
row_id!(SearchIndexId, "searchindex");
row_id!(TimelineId, "timeline");
row_id!(ViewId, "view");
row_id!(EventRowId, "event");
row_id!(CommentId, "comment");
row_id!(AnalysisId, "analysis");
row_id!(UserId, "user");

/// Annotations written by analyzers are attributed to this user.
pub const SYSTEM_USER: UserId = UserId::from_raw(0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = SketchId::from_raw(42);
        let parsed: SketchId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_str_rejects_non_numeric() {
        assert!("sketch-1".parse::<SketchId>().is_err());
    }

    #[test]
    fn serde_is_transparent() {
        let json = serde_json::to_string(&ViewId::from_raw(7)).unwrap();
        assert_eq!(json, "7");
        let parsed: ViewId = serde_json::from_str("7").unwrap();
        assert_eq!(parsed.get(), 7);
    }

    #[test]
    fn system_user_is_zero() {
        assert_eq!(SYSTEM_USER.get(), 0);
        assert_eq!(UserId::label(), "user");
    }
}
