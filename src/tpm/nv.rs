use super::types::{AttributeQuery, HashAlgorithmId, NvAttribute, TypeError};
use super::{MalformedOutput, Result, ValidationError};
use either::Either;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::fmt;

/// Public area of one NV index as listed by `tpm2_nvreadpublic`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvPublic {
    address: u32,
    name: Option<String>,
    hash_alg: HashAlgorithmId,
    attributes: u32,
    size: u64,
}

impl NvPublic {
    pub fn new(
        address: u32,
        name: Option<String>,
        hash_alg: u16,
        attributes: u32,
        size: i64,
    ) -> Result<Self> {
        let size = u64::try_from(size).map_err(|_| ValidationError::NegativeSize(size))?;
        Ok(Self {
            address,
            name,
            hash_alg: hash_alg.into(),
            attributes,
            size,
        })
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn hash_alg(&self) -> HashAlgorithmId {
        self.hash_alg
    }

    pub fn attributes(&self) -> u32 {
        self.attributes
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn friendly_attributes(&self) -> Vec<&'static str> {
        NvAttribute::friendly(self.attributes)
    }

    pub fn friendly_hash_alg(&self) -> &'static str {
        self.hash_alg.name()
    }

    pub fn has_attr(&self, attr: impl AttributeQuery) -> Result<bool, TypeError> {
        Ok(attr.resolve()?.is_set(self.attributes))
    }
}

impl fmt::Display for NvPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Address: {:#x}", self.address)?;
        writeln!(f, "  Name: {}", self.name().unwrap_or("None"))?;
        writeln!(f, "  hash algorithm:")?;
        writeln!(f, "    friendly: {}", self.friendly_hash_alg())?;
        writeln!(f, "    value: {:#x}", self.hash_alg.0)?;
        writeln!(f, "  attributes:")?;
        writeln!(f, "    friendly: {}", self.friendly_attributes().join("|"))?;
        writeln!(f, "    value: {:#x}", self.attributes)?;
        writeln!(f, "  size: {}", self.size)
    }
}

/// Which field the next `value:` line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    None,
    HashAlg,
    Attributes,
}

#[derive(Debug, Default)]
struct Pending {
    address: Option<u32>,
    name: Option<String>,
    hash_alg: Option<u16>,
    attributes: Option<u32>,
    size: Option<i64>,
}

impl Pending {
    fn build(self, address: u32) -> Result<NvPublic> {
        let missing = |field| MalformedOutput::MissingField { address, field };
        NvPublic::new(
            address,
            self.name,
            self.hash_alg.ok_or_else(|| missing("hash algorithm"))?,
            self.attributes.ok_or_else(|| missing("attributes"))?,
            self.size.ok_or_else(|| missing("size"))?,
        )
    }
}

/// Line driven parser for `tpm2_nvreadpublic` output.
///
/// Entries start with an `<address>:` header and end at a blank line. The
/// `hash algorithm` and `attributes` headers arm [`Mode`] so that the next
/// `value:` line is assigned to the right field.
#[derive(Debug)]
pub struct NvPublicParser {
    mode: Mode,
    pending: Pending,
    records: Vec<NvPublic>,
}

impl Default for NvPublicParser {
    fn default() -> Self {
        Self {
            mode: Mode::None,
            pending: Pending::default(),
            records: Vec::new(),
        }
    }
}

fn parse_hex_u32(field: &'static str, value: &str) -> Result<u32> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|_| {
        MalformedOutput::InvalidHex {
            field,
            value: value.to_string(),
        }
        .into()
    })
}

fn field_value(line: &str) -> &str {
    line.split_once(':').map(|(_, v)| v.trim()).unwrap_or("")
}

fn is_field_line(line: &str) -> bool {
    ["value:", "name:", "size:", "hash algorithm", "attributes"]
        .iter()
        .any(|p| line.starts_with(p))
}

fn set_once<T>(slot: &mut Option<T>, value: T, field: &'static str) -> Result<()> {
    if slot.is_some() {
        return Err(MalformedOutput::DuplicateField(field).into());
    }
    *slot = Some(value);
    Ok(())
}

impl NvPublicParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) -> Result<()> {
        let line = line.trim();

        if line.is_empty() {
            return self.flush();
        }

        if self.pending.address.is_none() {
            if is_field_line(line) {
                return Err(MalformedOutput::MissingAddress(line.to_string()).into());
            }
            let (address, _) = line
                .split_once(':')
                .ok_or_else(|| MalformedOutput::InvalidAddress(line.to_string()))?;
            let address = parse_hex_u32("address", address.trim())
                .map_err(|_| MalformedOutput::InvalidAddress(line.to_string()))?;
            self.pending.address = Some(address);
            return Ok(());
        }

        if line.starts_with("value:") {
            let value = field_value(line);
            match self.mode {
                Mode::HashAlg => {
                    let hash_alg = parse_hex_u32("hash algorithm", value)?;
                    let hash_alg = u16::try_from(hash_alg).map_err(|_| {
                        MalformedOutput::InvalidHex {
                            field: "hash algorithm",
                            value: value.to_string(),
                        }
                    })?;
                    set_once(&mut self.pending.hash_alg, hash_alg, "hash algorithm")?;
                }
                Mode::Attributes => {
                    let attributes = parse_hex_u32("attributes", value)?;
                    set_once(&mut self.pending.attributes, attributes, "attributes")?;
                }
                Mode::None => {
                    return Err(MalformedOutput::UnexpectedValue(line.to_string()).into())
                }
            }
            self.mode = Mode::None;
        } else if line.starts_with("name:") {
            set_once(&mut self.pending.name, field_value(line).to_string(), "name")?;
        } else if line.starts_with("size:") {
            let value = field_value(line);
            let size = value
                .parse::<i64>()
                .map_err(|_| MalformedOutput::InvalidSize(value.to_string()))?;
            set_once(&mut self.pending.size, size, "size")?;
        } else if line.starts_with("hash algorithm") {
            self.mode = Mode::HashAlg;
        } else if line.starts_with("attributes") {
            self.mode = Mode::Attributes;
        } else {
            log::trace!("ignoring nvreadpublic line: {}", line);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let Some(address) = self.pending.address else {
            return Ok(());
        };
        if self.mode != Mode::None {
            return Err(MalformedOutput::MissingValue { address }.into());
        }
        let pending = std::mem::take(&mut self.pending);
        self.records.push(pending.build(address)?);
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<NvPublic>> {
        if let Some(address) = self.pending.address {
            return Err(MalformedOutput::UnterminatedEntry(address).into());
        }
        if self.records.is_empty() {
            return Err(MalformedOutput::NoRecords.into());
        }
        Ok(self.records)
    }
}

/// Parses `tpm2_nvreadpublic` output, returning the lone record on the left
/// when exactly one entry is present.
pub fn parse_nv_public(output: &str) -> Result<Either<NvPublic, Vec<NvPublic>>> {
    let mut parser = NvPublicParser::new();
    for line in output.lines() {
        parser.feed(line)?;
    }
    let mut records = parser.finish()?;
    if records.len() == 1 {
        Ok(Either::Left(records.remove(0)))
    } else {
        Ok(Either::Right(records))
    }
}

/// NV index handles in the order they were first listed, with declared sizes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleMap(Vec<(String, u64)>);

impl HandleMap {
    pub fn insert(&mut self, handle: String, size: u64) {
        match self.0.iter_mut().find(|(h, _)| *h == handle) {
            Some(entry) => entry.1 = size,
            None => self.0.push((handle, size)),
        }
    }

    pub fn get(&self, handle: &str) -> Option<u64> {
        self.0.iter().find(|(h, _)| h == handle).map(|(_, s)| *s)
    }

    /// Handle at `index` in listing order.
    pub fn nth(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(|(h, _)| h.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(h, s)| (h.as_str(), *s))
    }
}

impl fmt::Display for HandleMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listed = self
            .iter()
            .enumerate()
            .map(|(i, (handle, _))| format!("{i}: {handle}"))
            .collect::<Vec<_>>();
        f.write_str(&listed.join(", "))
    }
}

static HANDLE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(0x[0-9a-fA-F]{7}):\n.+?size: (\d+)\n+").unwrap());

/// Builds the handle map from raw `tpm2_nvreadpublic` output. Output without
/// any NV index yields an empty map.
pub fn scan_handles(output: &[u8]) -> Result<HandleMap> {
    let mut handles = HandleMap::default();
    for caps in HANDLE_BLOCK.captures_iter(output) {
        let handle = String::from_utf8_lossy(&caps[1]).into_owned();
        let size = String::from_utf8_lossy(&caps[2]);
        let size = size
            .parse::<u64>()
            .map_err(|_| MalformedOutput::InvalidSize(size.to_string()))?;
        handles.insert(handle, size);
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::TpmError;
    use eyre::Result;

    const SINGLE: &str = "0x1500016:\n  name: 000100000000\n  hash algorithm:\n    value: 000b\n  attributes:\n    value: 2000a\n  size: 34\n\n";

    const TOOL_OUTPUT: &str = "\
0x1500016:
  name: 000b6e1ed6a4d1b1b5b8a4f1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3
  hash algorithm:
    friendly: sha256
    value: 0xB
  attributes:
    friendly: ownerwrite|ownerread|written
    value: 0x2002000A
  size: 34

0x1500017:
  name: 000b1234
  hash algorithm:
    friendly: sha1
    value: 0x4
  attributes:
    friendly: ppwrite|ppread
    value: 0x10001
  authorization policy:
  size: 2048

";

    fn malformed(err: TpmError) -> MalformedOutput {
        match err {
            TpmError::MalformedOutput(m) => m,
            other => panic!("expected malformed output, got {other:?}"),
        }
    }

    #[test]
    fn single_entry() -> Result<()> {
        let record = parse_nv_public(SINGLE)?.left().expect("single record");
        assert_eq!(record.address(), 0x1500016);
        assert_eq!(record.name(), Some("000100000000"));
        assert_eq!(record.hash_alg(), HashAlgorithmId(0x000b));
        assert_eq!(record.attributes(), 0x2000a);
        assert_eq!(record.size(), 34);
        assert_eq!(record.friendly_hash_alg(), "TPM_ALG_SHA256");
        Ok(())
    }

    #[test]
    fn multiple_entries_keep_order() -> Result<()> {
        let records = parse_nv_public(TOOL_OUTPUT)?.right().expect("two records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address(), 0x1500016);
        assert_eq!(records[0].attributes(), 0x2002000a);
        assert!(records[0].has_attr(NvAttribute::Written)?);
        assert_eq!(records[1].address(), 0x1500017);
        assert_eq!(records[1].friendly_hash_alg(), "TPM_ALG_SHA1");
        assert_eq!(records[1].size(), 2048);
        assert!(records[1].has_attr("tpma_nv_ppread")?);
        assert!(!records[1].has_attr("TPMA_NV_OWNERREAD")?);
        Ok(())
    }

    #[test]
    fn has_attr_rejects_unknown_name() -> Result<()> {
        let record = parse_nv_public(SINGLE)?.left().expect("single record");
        assert_eq!(
            record.has_attr("bogus"),
            Err(TypeError::InvalidAttribute("bogus".to_string()))
        );
        Ok(())
    }

    #[test]
    fn leading_blank_lines_are_ignored() -> Result<()> {
        let output = format!("\n\n{SINGLE}");
        assert!(parse_nv_public(&output)?.is_left());
        Ok(())
    }

    #[test]
    fn value_without_header() {
        let output = format!("{SINGLE}0x1500017:\n  value: 0004\n  size: 4\n\n");
        let err = parse_nv_public(&output).unwrap_err();
        assert!(matches!(
            malformed(err),
            MalformedOutput::UnexpectedValue(_)
        ));
    }

    #[test]
    fn header_consumed_by_value() {
        let output = "0x1500016:\n  hash algorithm:\n    value: 000b\n    value: 0004\n  size: 4\n\n";
        let err = parse_nv_public(output).unwrap_err();
        assert!(matches!(
            malformed(err),
            MalformedOutput::UnexpectedValue(_)
        ));
    }

    #[test]
    fn field_before_address() {
        let err = parse_nv_public("  name: 0001\n  size: 4\n\n").unwrap_err();
        assert_eq!(
            malformed(err),
            MalformedOutput::MissingAddress("name: 0001".to_string())
        );
    }

    #[test]
    fn bad_address() {
        let err = parse_nv_public("zz:\n  size: 4\n\n").unwrap_err();
        assert_eq!(
            malformed(err),
            MalformedOutput::InvalidAddress("zz:".to_string())
        );
    }

    #[test]
    fn duplicate_name() {
        let output = "0x1500016:\n  name: 0001\n  name: 0002\n\n";
        let err = parse_nv_public(output).unwrap_err();
        assert_eq!(malformed(err), MalformedOutput::DuplicateField("name"));
    }

    #[test]
    fn missing_size() {
        let output = "0x1500016:\n  hash algorithm:\n    value: b\n  attributes:\n    value: 2\n\n";
        let err = parse_nv_public(output).unwrap_err();
        assert_eq!(
            malformed(err),
            MalformedOutput::MissingField {
                address: 0x1500016,
                field: "size"
            }
        );
    }

    #[test]
    fn header_without_value() {
        let err = parse_nv_public("0x1500016:\n  attributes:\n\n").unwrap_err();
        assert_eq!(
            malformed(err),
            MalformedOutput::MissingValue { address: 0x1500016 }
        );
    }

    #[test]
    fn negative_size() {
        let output = SINGLE.replace("size: 34", "size: -1");
        match parse_nv_public(&output).unwrap_err() {
            TpmError::ValidationFailed(ValidationError::NegativeSize(-1)) => {}
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn no_records() {
        for output in ["", "\n\n", "   \n"] {
            let err = parse_nv_public(output).unwrap_err();
            assert_eq!(malformed(err), MalformedOutput::NoRecords);
        }
    }

    #[test]
    fn unterminated_entry() {
        let output = SINGLE.trim_end();
        let err = parse_nv_public(output).unwrap_err();
        assert_eq!(malformed(err), MalformedOutput::UnterminatedEntry(0x1500016));
    }

    #[test]
    fn display_layout() -> Result<()> {
        let record = parse_nv_public(SINGLE)?.left().expect("single record");
        let shown = record.to_string();
        assert!(shown.starts_with("Address: 0x1500016\n"));
        assert!(shown.contains("    friendly: TPM_ALG_SHA256\n"));
        assert!(shown.contains(
            "    friendly: TPMA_NV_OWNERWRITE|TPMA_NV_POLICYWRITE|TPMA_NV_OWNERREAD\n"
        ));
        assert!(shown.ends_with("  size: 34\n"));
        Ok(())
    }

    #[test]
    fn scan_two_handles() -> Result<()> {
        let handles = scan_handles(TOOL_OUTPUT.as_bytes())?;
        assert_eq!(handles.len(), 2);
        assert_eq!(handles.get("0x1500016"), Some(34));
        assert_eq!(handles.get("0x1500017"), Some(2048));
        assert_eq!(handles.nth(0), Some("0x1500016"));
        assert_eq!(handles.nth(1), Some("0x1500017"));
        assert_eq!(handles.to_string(), "0: 0x1500016, 1: 0x1500017");
        Ok(())
    }

    #[test]
    fn scan_without_handles() -> Result<()> {
        assert!(scan_handles(b"")?.is_empty());
        assert!(scan_handles(b"nothing to see here\n")?.is_empty());
        Ok(())
    }

    #[test]
    fn repeated_handle_keeps_position() {
        let mut handles = HandleMap::default();
        handles.insert("0x1500016".to_string(), 1);
        handles.insert("0x1500017".to_string(), 2);
        handles.insert("0x1500016".to_string(), 3);
        assert_eq!(handles.len(), 2);
        assert_eq!(handles.nth(0), Some("0x1500016"));
        assert_eq!(handles.get("0x1500016"), Some(3));
    }
}
