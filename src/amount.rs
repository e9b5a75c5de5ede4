//! Transfer amount validation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::RelayError;

/// Amount in the destination asset's smallest unit. Always non-zero once validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Amount(pub u128);

impl Amount {
    pub fn get(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Amount as it appears in an event payload: either a decimal string or a JSON number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AmountInput {
    Text(String),
    Number(serde_json::Number),
}

impl fmt::Display for AmountInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmountInput::Text(text) => write!(f, "{:?}", text),
            AmountInput::Number(number) => write!(f, "{}", number),
        }
    }
}

impl From<&str> for AmountInput {
    fn from(value: &str) -> Self {
        AmountInput::Text(value.to_string())
    }
}

impl From<u64> for AmountInput {
    fn from(value: u64) -> Self {
        AmountInput::Number(value.into())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AmountValidator {
    max: u128,
}

impl Default for AmountValidator {
    fn default() -> Self {
        Self { max: u128::MAX }
    }
}

impl AmountValidator {
    pub fn new(max: u128) -> Self {
        Self { max }
    }

    /// Build from the optional `processing.max_amount` setting.
    pub fn from_setting(max: Option<&str>) -> Result<Self, RelayError> {
        match max {
            None => Ok(Self::default()),
            Some(text) => {
                let max = parse_digits(text.trim()).ok_or_else(|| {
                    RelayError::Config(format!("Invalid max_amount: {}", text))
                })?;
                Ok(Self::new(max))
            }
        }
    }

    /// Reject anything that is not a positive integer within range. No clamping.
    pub fn validate(&self, raw: &AmountInput) -> Result<Amount, RelayError> {
        let invalid = |why: &str| RelayError::InvalidAmount(format!("{} ({})", raw, why));

        let value = match raw {
            AmountInput::Text(text) => {
                let text = text.trim();
                if text.starts_with('-') {
                    return Err(invalid("negative"));
                }
                if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid("not an integer"));
                }
                parse_digits(text).ok_or_else(|| invalid("overflow"))?
            }
            AmountInput::Number(number) => {
                if let Some(value) = number.as_u64() {
                    value as u128
                } else if number.as_i64().is_some() {
                    return Err(invalid("negative"));
                } else {
                    return Err(invalid("not an integer"));
                }
            }
        };

        if value == 0 {
            return Err(invalid("zero"));
        }
        if value > self.max {
            return Err(invalid("exceeds maximum transferable amount"));
        }
        Ok(Amount(value))
    }
}

fn parse_digits(text: &str) -> Option<u128> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}
