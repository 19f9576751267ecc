//! Severity levels shared by findings, vulnerabilities and scans.

use std::{fmt, result, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Kind;

/// Finding severity.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub enum Severity {
    /// No severity assigned.
    None,
    /// Informational finding.
    Info,
    /// Secure implementation detected.
    Secure,
    /// Low severity.
    Low,
    /// Medium severity.
    Medium,
    /// High severity.
    High,
    /// Critical severity.
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::None
    }
}

impl Severity {
    /// Gets the highest severity of the given iterator, `None` if it is empty.
    pub fn highest<I: IntoIterator<Item = Severity>>(severities: I) -> Severity {
        severities.into_iter().max().unwrap_or_default()
    }
}

impl fmt::Display for Severity {
    #[allow(clippy::use_debug)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for Severity {
    type Err = Kind;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "secure" => Ok(Severity::Secure),
            "info" | "warning" => Ok(Severity::Info),
            "none" | "" => Ok(Severity::None),
            _ => Err(Kind::Parse {
                message: format!("invalid severity `{}`", s),
            }),
        }
    }
}

impl Serialize for Severity {
    fn serialize<S>(&self, serializer: S) -> result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(de: D) -> result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(de)?;
        Severity::from_str(&value).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::Severity;
    use std::str::FromStr;

    #[test]
    fn it_severity() {
        assert_eq!(Severity::from_str("critical").unwrap(), Severity::Critical);
        assert_eq!(Severity::from_str("Critical").unwrap(), Severity::Critical);
        assert_eq!(Severity::from_str("HIGH").unwrap(), Severity::High);
        assert_eq!(Severity::from_str("medium").unwrap(), Severity::Medium);
        assert_eq!(Severity::from_str("Low").unwrap(), Severity::Low);
        assert_eq!(Severity::from_str("secure").unwrap(), Severity::Secure);
        assert_eq!(Severity::from_str("warning").unwrap(), Severity::Info);
        assert_eq!(Severity::from_str("None").unwrap(), Severity::None);
        assert!(Severity::from_str("urgent").is_err());

        assert!(Severity::None < Severity::Info);
        assert!(Severity::Info < Severity::Secure);
        assert!(Severity::Secure < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);

        assert_eq!(format!("{}", Severity::Critical).as_str(), "Critical");
        assert_eq!(format!("{}", Severity::None).as_str(), "None");
    }

    #[test]
    fn it_highest() {
        assert_eq!(Severity::highest(vec![]), Severity::None);
        assert_eq!(
            Severity::highest(vec![Severity::Low, Severity::High, Severity::Info]),
            Severity::High
        );
    }

    #[test]
    fn it_serde() {
        let json = serde_json::to_string(&Severity::Medium).unwrap();
        assert_eq!(json, "\"Medium\"");
        let back: Severity = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(back, Severity::High);
    }
}
