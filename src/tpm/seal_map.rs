use super::{Result, ValidationError};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::Serialize;
use std::fmt;

static PRIV_LOCATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"priv=([0-9a-fA-F]{7})").unwrap());
static PUB_LOCATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"pub=([0-9a-fA-F]{7})").unwrap());

/// Where the private and public halves of the sealed key live
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SealMap {
    #[serde(rename = "priv")]
    private: String,
    #[serde(rename = "pub")]
    public: String,
}

fn find_location(data: &[u8], pattern: &Regex, field: &'static str) -> Result<String> {
    let location = pattern
        .captures(data)
        .map(|caps| String::from_utf8_lossy(&caps[1]).into_owned())
        .ok_or(ValidationError::MissingMapField(field))?;
    log::debug!("[{}] Read handle location: {}", field, location);
    Ok(location)
}

impl SealMap {
    /// Decodes the `priv=` / `pub=` tokens from a raw NV read.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(Self {
            private: find_location(data, &PRIV_LOCATION, "priv")?,
            public: find_location(data, &PUB_LOCATION, "pub")?,
        })
    }

    pub fn private(&self) -> &str {
        &self.private
    }

    pub fn public(&self) -> &str {
        &self.public
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "priv" => Some(&self.private),
            "pub" => Some(&self.public),
            _ => None,
        }
    }
}

impl fmt::Display for SealMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "priv={} pub={}", self.private, self.public)
    }
}
