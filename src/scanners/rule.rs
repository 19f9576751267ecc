//! Regex rules of the SAST scanner.

use std::{fmt, fs, path::Path};

use failure::{format_err, ResultExt};
use regex::Regex;
use serde::de::{self, Deserializer, SeqAccess, Visitor};

use crate::{error::Kind, severity::Severity, Result};

/// Vulnerability searching rule.
#[derive(Debug, Deserialize)]
pub struct Rule {
    #[serde(deserialize_with = "deserialize_main_regex")]
    regex: Regex,
    forward_check: Option<String>,
    max_sdk: Option<u32>,
    #[serde(deserialize_with = "deserialize_whitelist_regex")]
    #[serde(default)]
    whitelist: Box<[Regex]>,
    label: String,
    description: String,
    #[serde(default)]
    risk: String,
    #[serde(default)]
    mitigation: String,
    #[serde(alias = "criticality")]
    severity: Severity,
    #[serde(default)]
    language: Option<String>,
    #[serde(deserialize_with = "deserialize_file_regex")]
    #[serde(default)]
    include_file_regex: Option<Regex>,
    #[serde(deserialize_with = "deserialize_file_regex")]
    #[serde(default)]
    exclude_file_regex: Option<Regex>,
}

impl Rule {
    /// Gets the regex of the rule.
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Gets the potential forward check of the rule.
    pub fn forward_check(&self) -> Option<&str> {
        self.forward_check.as_ref().map(String::as_str)
    }

    /// Gets the maximum SDK affected by this vulnerability.
    pub fn max_sdk(&self) -> Option<u32> {
        self.max_sdk
    }

    /// Gets the label of the vulnerability.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Gets the description of the vulnerability.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Impact of a match, empty when the rule gives none.
    pub fn risk(&self) -> &str {
        &self.risk
    }

    /// How to fix a match, empty when the rule gives none.
    pub fn mitigation(&self) -> &str {
        &self.mitigation
    }

    /// Gets the severity of the vulnerabilities found by the rule.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Language of the matched code, if the rule pins one.
    pub fn language(&self) -> Option<&str> {
        self.language.as_ref().map(String::as_str)
    }

    /// Gets the whitelist regex list.
    pub fn whitelist(&self) -> impl Iterator<Item = &Regex> {
        self.whitelist.iter()
    }

    /// Returns if this rule has to be applied to the given filename.
    ///
    /// The exclusion regex wins over the inclusion one.
    pub fn has_to_check(&self, filename: &str) -> bool {
        if let Some(ref r) = self.exclude_file_regex {
            if r.is_match(filename) {
                return false;
            }
        }
        match self.include_file_regex {
            Some(ref r) => r.is_match(filename),
            None => true,
        }
    }

    /// Checks the capture groups used by the forward check.
    fn validate(&self) -> Result<()> {
        let fc1_in_regex = self.regex.capture_names().any(|c| c == Some("fc1"));
        let fc2_in_regex = self.regex.capture_names().any(|c| c == Some("fc2"));

        if let Some(forward_check) = self.forward_check() {
            if fc1_in_regex && !forward_check.contains("{fc1}") {
                return Err(format_err!(
                    "fc1 capture group used in `{}` but no placeholder found in the forward check",
                    self.label
                ));
            }
            if fc2_in_regex && !forward_check.contains("{fc2}") {
                return Err(format_err!(
                    "fc2 capture group used in `{}` but no placeholder found in the forward check",
                    self.label
                ));
            }
            if fc2_in_regex && !fc1_in_regex {
                warn!(
                    "fc2 capture group used in the `{}` rule's forward check, but no fc1 capture \
                     group used",
                    self.label
                );
            }
        } else if fc1_in_regex || fc2_in_regex {
            warn!(
                "capture groups fc1 and fc2 are only useful with a forward check, `{}` has none",
                self.label
            );
        }
        Ok(())
    }
}

/// Regular expression serde visitor.
struct RegexVisitor;

impl<'de> Visitor<'de> for RegexVisitor {
    type Value = Regex;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a valid regular expression")
    }

    fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
    where
        E: de::Error,
    {
        Regex::new(value).map_err(E::custom)
    }
}

fn deserialize_main_regex<'de, D>(deserializer: D) -> std::result::Result<Regex, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_str(RegexVisitor)
}

fn deserialize_whitelist_regex<'de, D>(
    deserializer: D,
) -> std::result::Result<Box<[Regex]>, D::Error>
where
    D: Deserializer<'de>,
{
    struct RegexSeqVisitor;

    impl<'de> Visitor<'de> for RegexSeqVisitor {
        type Value = Box<[Regex]>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a list of valid regular expressions")
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            use serde::de::Error;

            let mut list = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(regex_str) = seq.next_element::<String>()? {
                list.push(Regex::new(&regex_str).map_err(A::Error::custom)?);
            }
            Ok(list.into_boxed_slice())
        }
    }

    deserializer.deserialize_seq(RegexSeqVisitor)
}

fn deserialize_file_regex<'de, D>(deserializer: D) -> std::result::Result<Option<Regex>, D::Error>
where
    D: Deserializer<'de>,
{
    struct RegexOptionVisitor;

    impl<'de> Visitor<'de> for RegexOptionVisitor {
        type Value = Option<Regex>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a valid regular expression")
        }

        fn visit_some<D>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_str(RegexVisitor).map(Some)
        }

        fn visit_none<E>(self) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_option(RegexOptionVisitor)
}

/// Parses a rule list, keeping the rules at or above the given severity.
pub fn parse_rules(json: &str, min_severity: Severity) -> Result<Vec<Rule>> {
    let rules: Vec<Rule> = serde_json::from_str(json).map_err(|e| Kind::Parse {
        message: format!(
            "rules must be objects with a `label`, a `description`, a `severity` and a `regex`, \
             optionally with `whitelist`, `forward_check`, `max_sdk`, `language`, \
             `include_file_regex` and `exclude_file_regex`: {}",
            e
        ),
    })?;

    let mut kept = Vec::with_capacity(rules.len());
    for rule in rules {
        if rule.severity() < min_severity {
            continue;
        }
        rule.validate()?;
        kept.push(rule);
    }
    Ok(kept)
}

/// Loads the rule file.
pub fn load_rules<P: AsRef<Path>>(path: P, min_severity: Severity) -> Result<Vec<Rule>> {
    let path = path.as_ref();
    let json = fs::read_to_string(path)
        .with_context(|_| format!("could not read the rules at `{}`", path.display()))?;
    parse_rules(&json, min_severity)
}
