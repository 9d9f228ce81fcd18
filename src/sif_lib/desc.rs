/// On-disk record layouts and the typed descriptor model.
///
/// All multi-byte integers are little-endian. The records are declared with
/// alignment-1 field types only, so their in-memory layout is exactly the
/// wire layout: 128 bytes for the global header, 585 bytes per descriptor.
use std::io;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::mem::size_of;

use data_store::DataStore;
use zerocopy::byteorder::{LittleEndian, I32, I64, U32};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::sif_lib::error::{Error, Result};
use crate::sif_lib::types::{
    Arch, DataType, FormatType, FsType, HashType, MessageType, PartType, SbomFormat,
};
use crate::sif_lib::utils::trim_zero_bytes;

pub const HDR_LAUNCH_LEN: usize = 32;
pub const HDR_MAGIC_LEN: usize = 10;
pub const HDR_VERSION_LEN: usize = 3;
pub const HDR_ARCH_LEN: usize = 3;
pub const HDR_ID_LEN: usize = 16;

pub const HDR_MAGIC: [u8; HDR_MAGIC_LEN] = *b"SIF_MAGIC\0";
pub const CURRENT_VERSION: [u8; HDR_VERSION_LEN] = *b"01\0";
pub const DEFAULT_LAUNCH_SCRIPT: &str = "#!/usr/bin/env run-singularity\n";

pub const DESC_NAME_LEN: usize = 128;
pub const DESC_EXTRA_LEN: usize = 384;

/// Default number of descriptor slots
pub const DEFAULT_DESCRIPTOR_TOTAL: i64 = 48;
/// Byte offset of the descriptor table
pub const DESCR_START_OFFSET: i64 = 4096;
/// Byte offset of the data region with the default table capacity
pub const DATA_START_OFFSET: i64 = 32768;

/// Top-nibble marker tagging a stored group ID
pub const GROUP_MASK: u32 = 0xF000_0000;

pub const HEADER_SIZE: usize = size_of::<RawHeader>();
pub const DESCRIPTOR_SIZE: usize = size_of::<RawDescriptor>();

/// Global header, 128 bytes at offset zero
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct RawHeader {
    /*000*/ pub launch_script: [u8; HDR_LAUNCH_LEN],
    /*020*/ pub magic: [u8; HDR_MAGIC_LEN],
    /*02a*/ pub version: [u8; HDR_VERSION_LEN],
    /*02d*/ pub arch: [u8; HDR_ARCH_LEN],
    /*030*/ pub id: [u8; HDR_ID_LEN],
    /*040*/ pub created_at: I64<LittleEndian>,
    /*048*/ pub modified_at: I64<LittleEndian>,
    /*050*/ pub descriptors_free: I64<LittleEndian>,
    /*058*/ pub descriptors_total: I64<LittleEndian>,
    /*060*/ pub descriptors_offset: I64<LittleEndian>,
    /*068*/ pub descriptors_size: I64<LittleEndian>,
    /*070*/ pub data_offset: I64<LittleEndian>,
    /*078*/ pub data_size: I64<LittleEndian>,
}

/// One descriptor slot, 585 bytes in version 01
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct RawDescriptor {
    /*000*/ pub data_type: I32<LittleEndian>,
    /*004*/ pub used: u8,
    /*005*/ pub id: U32<LittleEndian>,
    /*009*/ pub group_id: U32<LittleEndian>,
    /*00d*/ pub linked_id: U32<LittleEndian>,
    /*011*/ pub offset: I64<LittleEndian>,
    /*019*/ pub size: I64<LittleEndian>,
    /*021*/ pub size_with_padding: I64<LittleEndian>,
    /*029*/ pub created_at: I64<LittleEndian>,
    /*031*/ pub modified_at: I64<LittleEndian>,
    /*039*/ pub uid: I64<LittleEndian>, /* historical, zero on new writes */
    /*041*/ pub gid: I64<LittleEndian>, /* historical, zero on new writes */
    /*049*/ pub name: [u8; DESC_NAME_LEN],
    /*0c9*/ pub extra: [u8; DESC_EXTRA_LEN],
}

impl RawDescriptor {
    pub fn is_used(&self) -> bool {
        self.used != 0
    }

    /// Group ID with the mask stripped; zero when the object has no group
    pub fn unmasked_group_id(&self) -> u32 {
        self.group_id.get() & !GROUP_MASK
    }

    /// Linked reference with the mask stripped, plus whether the reference
    /// is to a group
    pub fn unmasked_linked_id(&self) -> (u32, bool) {
        let raw = self.linked_id.get();
        (raw & !GROUP_MASK, raw & GROUP_MASK == GROUP_MASK)
    }

    pub fn is_partition(&self) -> bool {
        self.data_type.get() == i32::from(DataType::Partition)
    }

    /// Partition-type code without enum conversion, None for non-partitions
    pub fn partition_type_code(&self) -> Option<i32> {
        if !self.is_partition() {
            return None;
        }
        RawPartition::read_from(&self.extra[..size_of::<RawPartition>()])
            .map(|p| p.part_type.get())
    }

    pub fn is_primary_partition(&self) -> bool {
        self.is_used() && self.partition_type_code() == Some(i32::from(PartType::PrimarySystem))
    }
}

/// Extra payload of a partition descriptor
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct RawPartition {
    pub fs_type: I32<LittleEndian>,
    pub part_type: I32<LittleEndian>,
    pub arch: [u8; HDR_ARCH_LEN],
}

/// Extra payload of a signature descriptor
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct RawSignature {
    pub hash_type: I32<LittleEndian>,
    pub entity: [u8; ENTITY_LEN],
}

/// Extra payload of a crypto-message descriptor
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct RawCryptoMessage {
    pub format_type: I32<LittleEndian>,
    pub message_type: I32<LittleEndian>,
}

/// Extra payload of an SBOM descriptor
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct RawSbom {
    pub format: I32<LittleEndian>,
}

/// Length of a signing-entity fingerprint
pub const ENTITY_LEN: usize = 20;

/// Partition metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub fs_type: FsType,
    pub part_type: PartType,
    pub arch: Arch,
}

/// Signature metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub hash_type: HashType,
    pub entity: [u8; ENTITY_LEN],
}

/// Crypto-message metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoMessage {
    pub format_type: FormatType,
    pub message_type: MessageType,
}

/// SBOM metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sbom {
    pub format: SbomFormat,
}

/// Content digest of an OCI blob, stored as `"<algorithm>:<hex>"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciDigest {
    pub algorithm: String,
    pub hex: String,
}

impl std::fmt::Display for OciDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Variant-specific metadata serialized into the 384-byte extra window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extra {
    Partition(Partition),
    Signature(Signature),
    CryptoMessage(CryptoMessage),
    Sbom(Sbom),
    OciDigest(OciDigest),
    /// Raw bytes, preserved as-is; also the empty default
    Opaque(Vec<u8>),
}

impl Extra {
    /// Data types this metadata may be attached to; None means any
    pub fn compatible_types(&self) -> Option<Vec<DataType>> {
        match self {
            Extra::Partition(_) => Some(vec![DataType::Partition]),
            Extra::Signature(_) => Some(vec![DataType::Signature]),
            Extra::CryptoMessage(_) => Some(vec![DataType::CryptoMessage]),
            Extra::Sbom(_) => Some(vec![DataType::Sbom]),
            Extra::OciDigest(_) => Some(vec![DataType::OciRootIndex, DataType::OciBlob]),
            Extra::Opaque(_) => None,
        }
    }

    pub fn compatible_with(&self, data_type_code: i32) -> bool {
        match self.compatible_types() {
            Some(want) => want.iter().any(|dt| i32::from(*dt) == data_type_code),
            None => true,
        }
    }

    /// Serialize into a zero-padded extra window
    pub fn encode(&self) -> Result<[u8; DESC_EXTRA_LEN]> {
        let mut window = [0u8; DESC_EXTRA_LEN];
        match self {
            Extra::Partition(p) => {
                let raw = RawPartition {
                    fs_type: I32::new(i32::from(p.fs_type)),
                    part_type: I32::new(i32::from(p.part_type)),
                    arch: p.arch.to_bytes(),
                };
                window[..size_of::<RawPartition>()].copy_from_slice(raw.as_bytes());
            }
            Extra::Signature(s) => {
                let raw = RawSignature {
                    hash_type: I32::new(i32::from(s.hash_type)),
                    entity: s.entity,
                };
                window[..size_of::<RawSignature>()].copy_from_slice(raw.as_bytes());
            }
            Extra::CryptoMessage(m) => {
                let raw = RawCryptoMessage {
                    format_type: I32::new(i32::from(m.format_type)),
                    message_type: I32::new(i32::from(m.message_type)),
                };
                window[..size_of::<RawCryptoMessage>()].copy_from_slice(raw.as_bytes());
            }
            Extra::Sbom(s) => {
                let raw = RawSbom {
                    format: I32::new(i32::from(s.format)),
                };
                window[..size_of::<RawSbom>()].copy_from_slice(raw.as_bytes());
            }
            Extra::OciDigest(d) => {
                let s = d.to_string();
                // keep room for the NUL terminator
                if s.len() >= DESC_EXTRA_LEN {
                    return Err(Error::ExtraTooLarge);
                }
                window[..s.len()].copy_from_slice(s.as_bytes());
            }
            Extra::Opaque(bytes) => {
                if bytes.len() > DESC_EXTRA_LEN {
                    return Err(Error::ExtraTooLarge);
                }
                window[..bytes.len()].copy_from_slice(bytes);
            }
        }
        Ok(window)
    }
}

/// Random-access `Read + Seek` window over a region of the backing store
pub struct StoreReader<'a> {
    store: &'a dyn DataStore,
    base: u64,
    len: u64,
    pos: u64,
}

impl<'a> StoreReader<'a> {
    pub(crate) fn new(store: &'a dyn DataStore, base: u64, len: u64) -> Self {
        Self {
            store,
            base,
            len,
            pos: 0,
        }
    }
}

impl Read for StoreReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let want = buf.len().min((self.len - self.pos) as usize);
        let n = self.store.read_at(self.base + self.pos, &mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for StoreReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(n) => self.pos as i128 + n as i128,
            SeekFrom::End(n) => self.len as i128 + n as i128,
        };
        if target < 0 || target > u64::MAX as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of payload",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// Read-only view over one used descriptor slot
#[derive(Clone, Copy)]
pub struct Descriptor<'a> {
    pub(crate) raw: &'a RawDescriptor,
    pub(crate) relative_id: u32,
    pub(crate) store: &'a dyn DataStore,
}

impl<'a> Descriptor<'a> {
    /// Stored data-type sentinel, which may be unknown to this version
    pub fn data_type_code(&self) -> i32 {
        self.raw.data_type.get()
    }

    pub fn data_type(&self) -> Result<DataType> {
        DataType::try_from(self.raw.data_type.get()).map_err(|_| Error::UnexpectedDataType {
            got: self.raw.data_type.get(),
            want: vec![],
        })
    }

    pub fn id(&self) -> u32 {
        self.raw.id.get()
    }

    /// Object ID relative to the minimum ID of the object's group
    pub fn relative_id(&self) -> u32 {
        self.relative_id
    }

    /// Group ID with the mask stripped; zero when ungrouped
    pub fn group_id(&self) -> u32 {
        self.raw.unmasked_group_id()
    }

    /// Linked object or group reference; the flag is true for group links
    pub fn linked_id(&self) -> (u32, bool) {
        self.raw.unmasked_linked_id()
    }

    pub fn offset(&self) -> i64 {
        self.raw.offset.get()
    }

    pub fn size(&self) -> i64 {
        self.raw.size.get()
    }

    pub fn size_with_padding(&self) -> i64 {
        self.raw.size_with_padding.get()
    }

    pub fn created_at(&self) -> i64 {
        self.raw.created_at.get()
    }

    pub fn modified_at(&self) -> i64 {
        self.raw.modified_at.get()
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(trim_zero_bytes(&self.raw.name)).to_string()
    }

    fn check_data_type(&self, want: &[DataType]) -> Result<()> {
        let got = self.raw.data_type.get();
        if want.iter().any(|dt| i32::from(*dt) == got) {
            Ok(())
        } else {
            Err(Error::UnexpectedDataType {
                got,
                want: want.to_vec(),
            })
        }
    }

    pub fn partition_metadata(&self) -> Result<Partition> {
        self.check_data_type(&[DataType::Partition])?;
        let raw = RawPartition::read_from(&self.raw.extra[..size_of::<RawPartition>()])
            .ok_or_else(|| Error::Malformed("partition extra truncated".to_string()))?;
        Ok(Partition {
            fs_type: FsType::try_from(raw.fs_type.get())
                .map_err(|_| Error::Malformed(format!("unknown fs type {}", raw.fs_type.get())))?,
            part_type: PartType::try_from(raw.part_type.get()).map_err(|_| {
                Error::Malformed(format!("unknown partition type {}", raw.part_type.get()))
            })?,
            arch: Arch::from_bytes(&raw.arch),
        })
    }

    pub fn signature_metadata(&self) -> Result<Signature> {
        self.check_data_type(&[DataType::Signature])?;
        let raw = RawSignature::read_from(&self.raw.extra[..size_of::<RawSignature>()])
            .ok_or_else(|| Error::Malformed("signature extra truncated".to_string()))?;
        Ok(Signature {
            hash_type: HashType::try_from(raw.hash_type.get()).map_err(|_| {
                Error::Malformed(format!("unknown hash type {}", raw.hash_type.get()))
            })?,
            entity: raw.entity,
        })
    }

    pub fn crypto_message_metadata(&self) -> Result<CryptoMessage> {
        self.check_data_type(&[DataType::CryptoMessage])?;
        let raw = RawCryptoMessage::read_from(&self.raw.extra[..size_of::<RawCryptoMessage>()])
            .ok_or_else(|| Error::Malformed("crypto message extra truncated".to_string()))?;
        Ok(CryptoMessage {
            format_type: FormatType::try_from(raw.format_type.get()).map_err(|_| {
                Error::Malformed(format!("unknown message format {}", raw.format_type.get()))
            })?,
            message_type: MessageType::try_from(raw.message_type.get()).map_err(|_| {
                Error::Malformed(format!("unknown message type {}", raw.message_type.get()))
            })?,
        })
    }

    pub fn sbom_metadata(&self) -> Result<Sbom> {
        self.check_data_type(&[DataType::Sbom])?;
        let raw = RawSbom::read_from(&self.raw.extra[..size_of::<RawSbom>()])
            .ok_or_else(|| Error::Malformed("sbom extra truncated".to_string()))?;
        Ok(Sbom {
            format: SbomFormat::try_from(raw.format.get())
                .map_err(|_| Error::Malformed(format!("unknown sbom format {}", raw.format.get())))?,
        })
    }

    pub fn oci_blob_digest(&self) -> Result<OciDigest> {
        self.check_data_type(&[DataType::OciRootIndex, DataType::OciBlob])?;
        let s = String::from_utf8_lossy(trim_zero_bytes(&self.raw.extra));
        match s.split_once(':') {
            Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => Ok(OciDigest {
                algorithm: algorithm.to_string(),
                hex: hex.to_string(),
            }),
            _ => Err(Error::Malformed(format!("bad digest {:?}", s))),
        }
    }

    /// Raw extra window, for unknown or opaque data types
    pub fn extra(&self) -> &[u8; DESC_EXTRA_LEN] {
        &self.raw.extra
    }

    /// Random-access reader over the payload bytes
    pub fn reader(&self) -> StoreReader<'a> {
        StoreReader::new(self.store, self.raw.offset.get() as u64, self.raw.size.get() as u64)
    }

    /// Payload bytes in one buffer
    pub fn data(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.raw.size.get() as usize];
        self.store
            .read_exact_at(self.raw.offset.get() as u64, &mut buf)?;
        Ok(buf)
    }

    /// Stable byte stream fed to signing and verification.
    ///
    /// Field order is fixed: data type, used flag, relative ID, stored
    /// linked ID, size, creation time, UID, GID, name, extra. Absolute ID,
    /// offset, padded size, and modification time stay out so compaction,
    /// timestamp bumps, and cross-file renumbering keep signatures valid.
    pub fn integrity_reader(&self) -> Cursor<Vec<u8>> {
        let raw = self.raw;
        let mut buf = Vec::with_capacity(41 + DESC_NAME_LEN + DESC_EXTRA_LEN);
        buf.extend_from_slice(&raw.data_type.get().to_le_bytes());
        buf.push(raw.used);
        buf.extend_from_slice(&self.relative_id.to_le_bytes());
        buf.extend_from_slice(&raw.linked_id.get().to_le_bytes());
        buf.extend_from_slice(&raw.size.get().to_le_bytes());
        buf.extend_from_slice(&raw.created_at.get().to_le_bytes());
        buf.extend_from_slice(&raw.uid.get().to_le_bytes());
        buf.extend_from_slice(&raw.gid.get().to_le_bytes());
        buf.extend_from_slice(&raw.name);
        buf.extend_from_slice(&raw.extra);
        Cursor::new(buf)
    }
}

impl std::fmt::Debug for Descriptor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id())
            .field("data_type", &self.data_type_code())
            .field("group_id", &self.group_id())
            .field("linked_id", &self.linked_id())
            .field("offset", &self.offset())
            .field("size", &self.size())
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use data_store::BufferStore;

    #[test]
    fn record_sizes_match_wire_layout() {
        assert_eq!(HEADER_SIZE, 128);
        assert_eq!(DESCRIPTOR_SIZE, 585);
        assert_eq!(size_of::<RawPartition>(), 11);
        assert_eq!(size_of::<RawSignature>(), 24);
        assert_eq!(size_of::<RawCryptoMessage>(), 8);
        assert_eq!(size_of::<RawSbom>(), 4);
    }

    #[test]
    fn partition_extra_round_trip() -> Result<()> {
        let extra = Extra::Partition(Partition {
            fs_type: FsType::Squashfs,
            part_type: PartType::PrimarySystem,
            arch: Arch::Amd64,
        });
        let window = extra.encode()?;
        assert_eq!(&window[..4], &1i32.to_le_bytes());
        assert_eq!(&window[4..8], &2i32.to_le_bytes());
        assert_eq!(&window[8..11], b"02\0");
        assert!(window[11..].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn oci_digest_round_trip() -> Result<()> {
        let digest = OciDigest {
            algorithm: "sha256".to_string(),
            hex: "9d0f".to_string(),
        };
        let window = Extra::OciDigest(digest.clone()).encode()?;
        assert_eq!(&window[..11], b"sha256:9d0f");
        assert_eq!(window[11], 0);

        let mut raw = RawDescriptor::new_zeroed();
        raw.data_type = I32::new(i32::from(DataType::OciBlob));
        raw.used = 1;
        raw.extra = window;
        let store = BufferStore::new();
        let d = Descriptor {
            raw: &raw,
            relative_id: 0,
            store: &store,
        };
        assert_eq!(d.oci_blob_digest()?, digest);
        Ok(())
    }

    #[test]
    fn opaque_extra_bounds() {
        assert!(Extra::Opaque(vec![0xAA; DESC_EXTRA_LEN]).encode().is_ok());
        assert!(matches!(
            Extra::Opaque(vec![0xAA; DESC_EXTRA_LEN + 1]).encode(),
            Err(Error::ExtraTooLarge)
        ));
    }

    #[test]
    fn typed_reader_rejects_other_kind() {
        let mut raw = RawDescriptor::new_zeroed();
        raw.data_type = I32::new(i32::from(DataType::Generic));
        raw.used = 1;
        let store = BufferStore::new();
        let d = Descriptor {
            raw: &raw,
            relative_id: 0,
            store: &store,
        };
        assert!(matches!(
            d.partition_metadata(),
            Err(Error::UnexpectedDataType { got, .. }) if got == i32::from(DataType::Generic)
        ));
    }

    #[test]
    fn integrity_stream_layout() -> Result<()> {
        let mut raw = RawDescriptor::new_zeroed();
        raw.data_type = I32::new(i32::from(DataType::Generic));
        raw.used = 1;
        raw.id = U32::new(7);
        raw.linked_id = U32::new(3);
        raw.offset = I64::new(40960); // excluded from the stream
        raw.size = I64::new(2);
        raw.created_at = I64::new(1_590_175_859);
        raw.modified_at = I64::new(9_999_999_999); // excluded from the stream
        raw.name[..4].copy_from_slice(b"test");

        let store = BufferStore::new();
        let d = Descriptor {
            raw: &raw,
            relative_id: 6,
            store: &store,
        };
        let mut got = Vec::new();
        d.integrity_reader().read_to_end(&mut got)?;

        assert_eq!(got.len(), 41 + DESC_NAME_LEN + DESC_EXTRA_LEN);
        assert_eq!(&got[..4], &i32::from(DataType::Generic).to_le_bytes());
        assert_eq!(got[4], 1);
        assert_eq!(&got[5..9], &6u32.to_le_bytes());
        assert_eq!(&got[9..13], &3u32.to_le_bytes());
        assert_eq!(&got[13..21], &2i64.to_le_bytes());
        assert_eq!(&got[21..29], &1_590_175_859i64.to_le_bytes());
        assert_eq!(&got[45..49], b"test");
        Ok(())
    }

    #[test]
    fn payload_reader_seeks_within_window() -> Result<()> {
        let mut store = BufferStore::new();
        store.write_all_at(100, &[0xfa, 0xce, 0xfe, 0xed])?;
        let mut raw = RawDescriptor::new_zeroed();
        raw.used = 1;
        raw.offset = I64::new(100);
        raw.size = I64::new(4);
        let d = Descriptor {
            raw: &raw,
            relative_id: 0,
            store: &store,
        };

        let mut r = d.reader();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf)?;
        assert_eq!(buf, [0xfa, 0xce, 0xfe, 0xed]);

        r.seek(SeekFrom::End(-2))?;
        buf.clear();
        r.read_to_end(&mut buf)?;
        assert_eq!(buf, [0xfe, 0xed]);
        Ok(())
    }
}
