/// Typed views over the integer codes stored in headers and descriptors.
use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Sentinel identifying the payload kind of a data object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum DataType {
    Deffile = 0x4001,
    EnvVar = 0x4002,
    Labels = 0x4003,
    Partition = 0x4004,
    Signature = 0x4005,
    GenericJson = 0x4006,
    Generic = 0x4007,
    CryptoMessage = 0x4008,
    Sbom = 0x4009,
    OciRootIndex = 0x400A,
    OciBlob = 0x400B,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Deffile => "Def.FILE",
            DataType::EnvVar => "Env.Vars",
            DataType::Labels => "JSON.Labels",
            DataType::Partition => "FS",
            DataType::Signature => "Signature",
            DataType::GenericJson => "JSON.Generic",
            DataType::Generic => "Generic/Raw",
            DataType::CryptoMessage => "Cryptographic Message",
            DataType::Sbom => "SBOM",
            DataType::OciRootIndex => "OCI.RootIndex",
            DataType::OciBlob => "OCI.Blob",
        };
        write!(f, "{}", s)
    }
}

/// Filesystem held by a partition object
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum FsType {
    Squashfs = 1,
    Ext3 = 2,
    ImmutableObject = 3,
    Raw = 4,
    EncryptedSquashfs = 5,
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsType::Squashfs => "Squashfs",
            FsType::Ext3 => "Ext3",
            FsType::ImmutableObject => "Archive",
            FsType::Raw => "Raw",
            FsType::EncryptedSquashfs => "Encrypted squashfs",
        };
        write!(f, "{}", s)
    }
}

/// Role of a partition object within the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum PartType {
    System = 1,
    PrimarySystem = 2,
    Data = 3,
    Overlay = 4,
}

impl fmt::Display for PartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartType::System => "System",
            PartType::PrimarySystem => "Primary system",
            PartType::Data => "Data",
            PartType::Overlay => "Overlay",
        };
        write!(f, "{}", s)
    }
}

/// Hash algorithm recorded in a signature object
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum HashType {
    Sha256 = 1,
    Sha384 = 2,
    Sha512 = 3,
    Blake2s = 4,
    Blake2b = 5,
}

/// Envelope format of a crypto-message object
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum FormatType {
    OpenPgp = 1,
    Pem = 2,
}

/// Content of a crypto-message object
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum MessageType {
    ClearSignature = 1,
    RsaOaep = 2,
}

/// Document format of an SBOM object
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum SbomFormat {
    CycloneDxJson = 1,
    CycloneDxXml = 2,
    GithubJson = 3,
    SpdxJson = 4,
    SpdxRdf = 5,
    SpdxTagValue = 6,
    SpdxYaml = 7,
    SyftJson = 8,
}

/// CPU architecture of the primary partition, stored as a two-ASCII-digit
/// code in the 3-byte arch slots of the header and partition extras
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Unknown,
    I386,
    Amd64,
    Arm,
    Arm64,
    Ppc64,
    Ppc64le,
    Mips,
    Mipsle,
    Mips64,
    Mips64le,
    S390x,
    Riscv64,
}

const ARCH_TABLE: [(Arch, &str, &str); 13] = [
    (Arch::Unknown, "00", "unknown"),
    (Arch::I386, "01", "386"),
    (Arch::Amd64, "02", "amd64"),
    (Arch::Arm, "03", "arm"),
    (Arch::Arm64, "04", "arm64"),
    (Arch::Ppc64, "05", "ppc64"),
    (Arch::Ppc64le, "06", "ppc64le"),
    (Arch::Mips, "07", "mips"),
    (Arch::Mipsle, "08", "mipsle"),
    (Arch::Mips64, "09", "mips64"),
    (Arch::Mips64le, "10", "mips64le"),
    (Arch::S390x, "11", "s390x"),
    (Arch::Riscv64, "12", "riscv64"),
];

impl Arch {
    /// Two-digit wire code, e.g. `"02"`
    pub fn code(&self) -> &'static str {
        ARCH_TABLE.iter().find(|(a, _, _)| a == self).unwrap().1
    }

    /// Platform token, e.g. `"amd64"`
    pub fn name(&self) -> &'static str {
        ARCH_TABLE.iter().find(|(a, _, _)| a == self).unwrap().2
    }

    /// 3-byte wire form (code plus NUL)
    pub fn to_bytes(&self) -> [u8; 3] {
        let code = self.code().as_bytes();
        [code[0], code[1], 0]
    }

    /// Decode a 3-byte arch slot; unrecognized codes map to `Unknown`
    pub fn from_bytes(bytes: &[u8; 3]) -> Arch {
        let code = &bytes[..2];
        ARCH_TABLE
            .iter()
            .find(|(_, c, _)| c.as_bytes() == code)
            .map(|(a, _, _)| *a)
            .unwrap_or(Arch::Unknown)
    }

    /// Look up an architecture by platform token
    pub fn from_name(name: &str) -> Option<Arch> {
        ARCH_TABLE
            .iter()
            .find(|(_, _, n)| *n == name)
            .map(|(a, _, _)| *a)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn data_type_codes() -> Result<()> {
        assert_eq!(i32::from(DataType::Deffile), 0x4001);
        assert_eq!(i32::from(DataType::OciBlob), 0x400B);
        assert_eq!(DataType::try_from(0x4004)?, DataType::Partition);
        assert!(DataType::try_from(0x4000).is_err());
        Ok(())
    }

    #[test]
    fn arch_round_trip() {
        assert_eq!(Arch::Amd64.code(), "02");
        assert_eq!(Arch::from_bytes(&Arch::Riscv64.to_bytes()), Arch::Riscv64);
        assert_eq!(Arch::from_bytes(b"99\0"), Arch::Unknown);
        assert_eq!(Arch::from_name("386"), Some(Arch::I386));
        assert_eq!(Arch::from_name("vax"), None);
    }
}
