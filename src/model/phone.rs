use crate::error::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const MIN_DIGITS: usize = 8;
const MAX_DIGITS: usize = 15;

/// A validated E.164 phone number (`+` followed by 8-15 digits).
///
/// Formatting separators (spaces, dashes, dots, parentheses) are stripped
/// before validation, so `+1 (415) 555-1234` and `+14155551234` are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhoneNumber(Arc<str>);

impl PhoneNumber {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("phone number is empty"));
        }

        let mut normalized = String::with_capacity(trimmed.len());
        for (idx, c) in trimmed.chars().enumerate() {
            match c {
                '+' if idx == 0 => normalized.push(c),
                '0'..='9' => normalized.push(c),
                ' ' | '-' | '.' | '(' | ')' => {}
                _ => {
                    return Err(Error::validation(format!(
                        "phone number '{}' contains invalid character '{}'",
                        input, c
                    )))
                }
            }
        }

        let Some(digits) = normalized.strip_prefix('+') else {
            return Err(Error::validation(format!(
                "phone number '{}' is not in E.164 format (missing leading '+')",
                input
            )));
        };

        if digits.len() < MIN_DIGITS || digits.len() > MAX_DIGITS {
            return Err(Error::validation(format!(
                "phone number '{}' must have between {} and {} digits",
                input, MIN_DIGITS, MAX_DIGITS
            )));
        }

        if digits.starts_with('0') {
            return Err(Error::validation(format!(
                "phone number '{}' has an invalid country code",
                input
            )));
        }

        Ok(Self(normalized.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The number without its leading `+`.
    pub fn digits(&self) -> &str {
        &self.0[1..]
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PhoneNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for PhoneNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for PhoneNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PhoneNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
