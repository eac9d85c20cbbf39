use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid attribute `{0}`")]
    InvalidAttribute(String),
}

/// NV index attribute bits, TPM 2.0 Part 2 Table 204 (TPMA_NV)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NvAttribute {
    PpWrite = 0,
    OwnerWrite = 1,
    AuthWrite = 2,
    PolicyWrite = 3,
    PolicyDelete = 10,
    WriteLocked = 11,
    WriteAll = 12,
    WriteDefine = 13,
    WriteStClear = 14,
    GlobalLock = 15,
    PpRead = 16,
    OwnerRead = 17,
    AuthRead = 18,
    PolicyRead = 19,
    NoDa = 25,
    Orderly = 26,
    ClearStClear = 27,
    ReadLocked = 28,
    Written = 29,
    PlatformCreate = 30,
    ReadStClear = 31,
}

impl NvAttribute {
    pub const ALL: [NvAttribute; 21] = [
        NvAttribute::PpWrite,
        NvAttribute::OwnerWrite,
        NvAttribute::AuthWrite,
        NvAttribute::PolicyWrite,
        NvAttribute::PolicyDelete,
        NvAttribute::WriteLocked,
        NvAttribute::WriteAll,
        NvAttribute::WriteDefine,
        NvAttribute::WriteStClear,
        NvAttribute::GlobalLock,
        NvAttribute::PpRead,
        NvAttribute::OwnerRead,
        NvAttribute::AuthRead,
        NvAttribute::PolicyRead,
        NvAttribute::NoDa,
        NvAttribute::Orderly,
        NvAttribute::ClearStClear,
        NvAttribute::ReadLocked,
        NvAttribute::Written,
        NvAttribute::PlatformCreate,
        NvAttribute::ReadStClear,
    ];

    pub fn bit(self) -> u8 {
        self as u8
    }

    pub fn mask(self) -> u32 {
        1 << self.bit()
    }

    pub fn is_set(self, attributes: u32) -> bool {
        attributes & self.mask() != 0
    }

    pub fn name(self) -> &'static str {
        match self {
            NvAttribute::PpWrite => "TPMA_NV_PPWRITE",
            NvAttribute::OwnerWrite => "TPMA_NV_OWNERWRITE",
            NvAttribute::AuthWrite => "TPMA_NV_AUTHWRITE",
            NvAttribute::PolicyWrite => "TPMA_NV_POLICYWRITE",
            NvAttribute::PolicyDelete => "TPMA_NV_POLICY_DELETE",
            NvAttribute::WriteLocked => "TPMA_NV_WRITELOCKED",
            NvAttribute::WriteAll => "TPMA_NV_WRITEALL",
            NvAttribute::WriteDefine => "TPMA_NV_WRITEDEFINE",
            NvAttribute::WriteStClear => "TPMA_NV_WRITE_STCLEAR",
            NvAttribute::GlobalLock => "TPMA_NV_GLOBALLOCK",
            NvAttribute::PpRead => "TPMA_NV_PPREAD",
            NvAttribute::OwnerRead => "TPMA_NV_OWNERREAD",
            NvAttribute::AuthRead => "TPMA_NV_AUTHREAD",
            NvAttribute::PolicyRead => "TPMA_NV_POLICYREAD",
            NvAttribute::NoDa => "TPMA_NV_NO_DA",
            NvAttribute::Orderly => "TPMA_NV_ORDERLY",
            NvAttribute::ClearStClear => "TPMA_NV_CLEAR_STCLEAR",
            NvAttribute::ReadLocked => "TPMA_NV_READLOCKED",
            NvAttribute::Written => "TPMA_NV_WRITTEN",
            NvAttribute::PlatformCreate => "TPMA_NV_PLATFORMCREATE",
            NvAttribute::ReadStClear => "TPMA_NV_READ_STCLEAR",
        }
    }

    /// Names of every known attribute set in `attributes`, lowest bit first.
    /// Reserved bits are skipped.
    pub fn friendly(attributes: u32) -> Vec<&'static str> {
        NvAttribute::ALL
            .iter()
            .filter(|a| a.is_set(attributes))
            .map(|a| a.name())
            .collect()
    }
}

static ATTRIBUTES_BY_NAME: Lazy<HashMap<&'static str, NvAttribute>> =
    Lazy::new(|| NvAttribute::ALL.iter().map(|a| (a.name(), *a)).collect());

impl FromStr for NvAttribute {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ATTRIBUTES_BY_NAME
            .get(s.to_uppercase().as_str())
            .copied()
            .ok_or_else(|| TypeError::InvalidAttribute(s.to_string()))
    }
}

/// Something that names an [`NvAttribute`], either the variant itself or its
/// `TPMA_NV_*` name in any case.
pub trait AttributeQuery {
    fn resolve(self) -> Result<NvAttribute, TypeError>;
}

impl AttributeQuery for NvAttribute {
    fn resolve(self) -> Result<NvAttribute, TypeError> {
        Ok(self)
    }
}

impl AttributeQuery for &str {
    fn resolve(self) -> Result<NvAttribute, TypeError> {
        self.parse()
    }
}

impl fmt::Display for NvAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub const UNKNOWN_ALGORITHM: &str = "Unknown";

/// TPM_ALG_ID values, TPM 2.0 Part 2 Table 8
static ALGORITHMS: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    [
        (0x0001, "TPM_ALG_RSA"),
        (0x0004, "TPM_ALG_SHA1"),
        (0x0005, "TPM_ALG_HMAC"),
        (0x0006, "TPM_ALG_AES"),
        (0x0007, "TPM_ALG_MGF1"),
        (0x0008, "TPM_ALG_KEYEDHASH"),
        (0x000A, "TPM_ALG_XOR"),
        (0x000B, "TPM_ALG_SHA256"),
        (0x000C, "TPM_ALG_SHA384"),
        (0x000D, "TPM_ALG_SHA512"),
        (0x0010, "TPM_ALG_NULL"),
        (0x0012, "TPM_ALG_SM3_256"),
        (0x0013, "TPM_ALG_SM4"),
        (0x0014, "TPM_ALG_RSASSA"),
        (0x0015, "TPM_ALG_RSAES"),
        (0x0016, "TPM_ALG_RSAPSS"),
        (0x0017, "TPM_ALG_OAEP"),
        (0x0018, "TPM_ALG_ECDSA"),
        (0x0019, "TPM_ALG_ECDH"),
        (0x001A, "TPM_ALG_ECDAA"),
        (0x001B, "TPM_ALG_SM2"),
        (0x001C, "TPM_ALG_ECSCHNORR"),
        (0x001D, "TPM_ALG_ECMQV"),
        (0x0020, "TPM_ALG_KDF1_SP800_56A"),
        (0x0021, "TPM_ALG_KDF2"),
        (0x0022, "TPM_ALG_KDF1_SP800_108"),
        (0x0023, "TPM_ALG_ECC"),
        (0x0025, "TPM_ALG_SYMCIPHER"),
        (0x0026, "TPM_ALG_CAMELLIA"),
        (0x0040, "TPM_ALG_CTR"),
        (0x0041, "TPM_ALG_OFB"),
        (0x0042, "TPM_ALG_CBC"),
        (0x0043, "TPM_ALG_CFB"),
        (0x0044, "TPM_ALG_ECB"),
    ]
    .into_iter()
    .collect()
});

/// A raw TPM_ALG_ID as reported by the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashAlgorithmId(pub u16);

impl HashAlgorithmId {
    pub fn name(self) -> &'static str {
        ALGORITHMS.get(&self.0).copied().unwrap_or(UNKNOWN_ALGORITHM)
    }

    pub fn is_known(self) -> bool {
        ALGORITHMS.contains_key(&self.0)
    }
}

impl From<u16> for HashAlgorithmId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for HashAlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
