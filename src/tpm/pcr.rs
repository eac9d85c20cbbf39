use std::collections::BTreeSet;
use thiserror::Error;

/// Highest PCR index on a PC client TPM
pub const MAX_PCR: u8 = 23;
pub const DEFAULT_BANK: &str = "sha256";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least on selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

fn parse_slot(slot: &str) -> Result<u8> {
    slot.trim()
        .parse::<u8>()
        .ok()
        .filter(|s| *s <= MAX_PCR)
        .ok_or_else(|| PcrError::InvalidPcrSlot(slot.to_string()))
}

/// Sorted, de-duplicated PCR indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection(BTreeSet<u8>);

impl PcrSelection {
    pub fn new(slots: &[u8]) -> Result<Self> {
        if slots.is_empty() {
            return Err(PcrError::EmptyPcrSelectionList);
        }
        if let Some(bad) = slots.iter().find(|s| **s > MAX_PCR) {
            return Err(PcrError::InvalidPcrSlot(bad.to_string()));
        }
        Ok(Self(slots.iter().copied().collect()))
    }

    pub fn slots(&self) -> Vec<u8> {
        self.0.iter().copied().collect()
    }

    /// Selection in tpm2-tools `bank:i,j` form
    pub fn to_tool_arg(&self) -> String {
        let slots = self
            .0
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!("{DEFAULT_BANK}:{slots}")
    }
}

pub fn parse_pcr_selection_list(expression: &str) -> Result<PcrSelection> {
    let slots = expression
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_slot)
        .collect::<Result<Vec<u8>>>()?;
    PcrSelection::new(&slots)
}
