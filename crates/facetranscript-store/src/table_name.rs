use std::fmt;
use std::str::FromStr;

/// A table name that is safe to splice into SQL.
///
/// Identifiers cannot be bound as parameters, so names are restricted to
/// ASCII letters, digits and `_`, not starting with a digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        (valid_start && valid_rest).then_some(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self("users".to_string())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TableName {
    type Err = crate::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s).ok_or_else(|| crate::StoreError::InvalidTableName(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_identifiers() {
        for name in ["users", "_faces", "Users2", "face_set_v1"] {
            assert_eq!(TableName::new(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn test_rejects_injection_and_junk() {
        for name in ["", "1users", "users; DROP TABLE x", "user-name", "naïve", "a b", "users'"] {
            assert!(TableName::new(name).is_none(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn test_from_str_error() {
        assert!("bad name".parse::<TableName>().is_err());
        assert_eq!("ok".parse::<TableName>().unwrap().to_string(), "ok");
    }

    #[test]
    fn test_default_is_users() {
        assert_eq!(TableName::default().as_str(), "users");
    }
}
