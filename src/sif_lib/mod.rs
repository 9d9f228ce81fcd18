/// SIF container engine: file-image model, load/create/persist.
use std::cmp::max;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

pub use data_store;
use data_store::{DataStore, FileStore};
use log::debug;
use uuid::Uuid;
use zerocopy::byteorder::I64;
use zerocopy::{AsBytes, FromBytes};

pub mod desc;
pub mod error;
pub mod input;
mod ops;
pub mod select;
pub mod types;
pub mod utils;

pub use desc::{
    CryptoMessage, Descriptor, Extra, OciDigest, Partition, RawDescriptor, RawHeader, Sbom,
    Signature, StoreReader, CURRENT_VERSION, DATA_START_OFFSET, DEFAULT_DESCRIPTOR_TOTAL,
    DEFAULT_LAUNCH_SCRIPT, DESCRIPTOR_SIZE, DESCR_START_OFFSET, DESC_EXTRA_LEN, DESC_NAME_LEN,
    ENTITY_LEN, GROUP_MASK, HDR_MAGIC, HEADER_SIZE,
};
pub use error::{Error, Result};
pub use input::{AddOpts, CreateOpts, DeleteOpts, DescriptorInput, LoadOpts, SetOpts};
pub use select::{
    with_data_type, with_group_id, with_id, with_linked_group_id, with_linked_id, with_no_group,
    with_partition_type, SelectorFn,
};
pub use types::{
    Arch, DataType, FormatType, FsType, HashType, MessageType, PartType, SbomFormat,
};

use crate::sif_lib::input::resolve_time;
use crate::sif_lib::utils::{align_up, trim_zero_bytes};

/// One SIF container: global header, descriptor table and backing store
pub struct FileImage {
    store: Box<dyn DataStore>,
    header: RawHeader,
    descriptors: Vec<RawDescriptor>,
    /// Minimum object ID per stored group field, feeding relative IDs
    min_ids: HashMap<u32, u32>,
    /// Next object ID; never lowered by deletes, so signature references
    /// stay unambiguous
    next_id: u32,
    mutated: bool,
    close_on_unload: bool,
}

impl FileImage {
    /// Create a container in a fresh file at `path`
    pub fn create<P: AsRef<Path>>(path: P, mut opts: CreateOpts<'_>) -> Result<Self> {
        let store = FileStore::create(path.as_ref())?;
        opts.close_on_unload = true;
        Self::create_store(Box::new(store), opts)
    }

    /// Create a container in the given backing store
    pub fn create_store(store: Box<dyn DataStore>, mut opts: CreateOpts<'_>) -> Result<Self> {
        let capacity = opts.descriptor_capacity;
        if capacity <= 0 {
            return Err(Error::Malformed(format!(
                "descriptor capacity {} must be positive",
                capacity
            )));
        }
        if opts.inputs.len() as i64 > capacity {
            return Err(Error::InsufficientCapacity);
        }
        if opts.launch_script.len() > desc::HDR_LAUNCH_LEN {
            return Err(Error::LaunchScriptTooLarge);
        }

        let t = resolve_time(opts.time, opts.deterministic);
        let id = opts.id.unwrap_or_else(|| {
            if opts.deterministic {
                Uuid::nil()
            } else {
                Uuid::new_v4()
            }
        });

        let descriptors_size = capacity * DESCRIPTOR_SIZE as i64;
        let data_offset = max(
            DATA_START_OFFSET,
            align_up(DESCR_START_OFFSET + descriptors_size, DESCR_START_OFFSET),
        );

        let mut header = RawHeader::new_zeroed();
        header.launch_script[..opts.launch_script.len()]
            .copy_from_slice(opts.launch_script.as_bytes());
        header.magic = HDR_MAGIC;
        header.version = CURRENT_VERSION;
        header.arch = Arch::Unknown.to_bytes();
        header.id = *id.as_bytes();
        header.created_at = I64::new(t);
        header.modified_at = I64::new(t);
        header.descriptors_free = I64::new(capacity);
        header.descriptors_total = I64::new(capacity);
        header.descriptors_offset = I64::new(DESCR_START_OFFSET);
        header.descriptors_size = I64::new(descriptors_size);
        header.data_offset = I64::new(data_offset);
        header.data_size = I64::new(0);

        let mut image = FileImage {
            store,
            header,
            descriptors: vec![RawDescriptor::new_zeroed(); capacity as usize],
            min_ids: HashMap::new(),
            next_id: 1,
            mutated: true,
            close_on_unload: opts.close_on_unload,
        };

        // first primary wins; a second one fails the whole create
        for input in std::mem::take(&mut opts.inputs) {
            if input.is_primary_partition() && image.primary_partition_index().is_some() {
                return Err(Error::PrimaryPartition);
            }
            image.write_data_object(input, t)?;
        }

        let end = (image.header.data_offset.get() + image.header.data_size.get()) as u64;
        if image.store.len()? < end {
            image.store.truncate(end)?;
        }
        image.flush()?;
        debug!("created image {} ({} descriptor slots)", id, capacity);
        Ok(image)
    }

    /// Load a container from a file at `path`
    pub fn load<P: AsRef<Path>>(path: P, opts: LoadOpts) -> Result<Self> {
        let store = FileStore::open(path.as_ref(), opts.read_only)?;
        Self::load_store(Box::new(store), opts.close_on_unload(true))
    }

    /// Load a container from the given backing store, validating the
    /// layout invariants
    pub fn load_store(store: Box<dyn DataStore>, opts: LoadOpts) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        read_exact_or_malformed(store.as_ref(), 0, &mut buf, "header")?;
        let header = RawHeader::read_from(&buf[..])
            .ok_or_else(|| Error::Malformed("short header".to_string()))?;

        if header.magic != HDR_MAGIC {
            return Err(Error::Malformed("bad magic".to_string()));
        }
        if header.version != CURRENT_VERSION {
            return Err(Error::Malformed(format!(
                "unsupported version {:?}",
                String::from_utf8_lossy(trim_zero_bytes(&header.version))
            )));
        }

        let total = header.descriptors_total.get();
        let descriptors_offset = header.descriptors_offset.get();
        let data_offset = header.data_offset.get();
        let data_size = header.data_size.get();
        if total <= 0 || descriptors_offset < HEADER_SIZE as i64 || data_size < 0 {
            return Err(Error::Malformed("inconsistent header geometry".to_string()));
        }
        let table_size = total * DESCRIPTOR_SIZE as i64;
        if descriptors_offset + table_size > data_offset {
            return Err(Error::Malformed(
                "descriptor table overlaps data region".to_string(),
            ));
        }

        let mut table = vec![0u8; table_size as usize];
        read_exact_or_malformed(
            store.as_ref(),
            descriptors_offset as u64,
            &mut table,
            "descriptor table",
        )?;
        let descriptors: Vec<RawDescriptor> = table
            .chunks_exact(DESCRIPTOR_SIZE)
            .map(|chunk| RawDescriptor::read_from(chunk).unwrap())
            .collect();

        let mut image = FileImage {
            store,
            header,
            descriptors,
            min_ids: HashMap::new(),
            next_id: 1,
            mutated: false,
            close_on_unload: opts.close_on_unload,
        };
        image.next_id = image.max_used_id() + 1;
        image.validate()?;
        image.populate_min_ids();
        debug!(
            "loaded image {} with {} used descriptors",
            image.id(),
            image.descriptors_total() - image.descriptors_free()
        );
        Ok(image)
    }

    fn validate(&self) -> Result<()> {
        let free = self.descriptors.iter().filter(|d| !d.is_used()).count() as i64;
        if free != self.header.descriptors_free.get() {
            return Err(Error::Malformed(format!(
                "{} free slots but header claims {}",
                free,
                self.header.descriptors_free.get()
            )));
        }

        let data_offset = self.header.data_offset.get();
        let data_end = data_offset + self.header.data_size.get();
        let mut seen = std::collections::HashSet::new();
        let mut primaries = 0;
        for rd in self.descriptors.iter().filter(|d| d.is_used()) {
            let id = rd.id.get();
            if id == 0 || !seen.insert(id) {
                return Err(Error::Malformed(format!("bad object ID {}", id)));
            }
            if rd.offset.get() < data_offset
                || rd.offset.get() + rd.size_with_padding.get() > data_end
            {
                return Err(Error::Malformed(format!(
                    "object {} lies outside the data region",
                    id
                )));
            }
            if rd.is_primary_partition() {
                primaries += 1;
            }
        }
        if primaries > 1 {
            return Err(Error::Malformed(
                "multiple primary system partitions".to_string(),
            ));
        }
        Ok(())
    }

    /// Flush descriptor table then header, then sync; payload bytes are
    /// already in place when this runs
    pub(crate) fn flush(&mut self) -> Result<()> {
        let mut table = Vec::with_capacity(self.descriptors.len() * DESCRIPTOR_SIZE);
        for rd in &self.descriptors {
            table.extend_from_slice(rd.as_bytes());
        }
        self.store
            .write_all_at(self.header.descriptors_offset.get() as u64, &table)?;
        self.store.write_all_at(0, self.header.as_bytes())?;
        self.store.sync()?;
        self.mutated = true;
        Ok(())
    }

    /// Release the image; hands the backing store back unless it is owned
    pub fn unload(mut self) -> Result<Option<Box<dyn DataStore>>> {
        if self.mutated {
            self.store.sync()?;
        }
        if self.close_on_unload {
            Ok(None)
        } else {
            Ok(Some(self.store))
        }
    }

    pub fn launch_script(&self) -> String {
        String::from_utf8_lossy(trim_zero_bytes(&self.header.launch_script)).to_string()
    }

    pub fn id(&self) -> Uuid {
        Uuid::from_bytes(self.header.id)
    }

    pub fn version(&self) -> String {
        String::from_utf8_lossy(trim_zero_bytes(&self.header.version)).to_string()
    }

    /// Architecture of the primary system partition, `Unknown` if there is
    /// no primary
    pub fn arch(&self) -> Arch {
        Arch::from_bytes(&self.header.arch)
    }

    pub fn created_at(&self) -> i64 {
        self.header.created_at.get()
    }

    pub fn modified_at(&self) -> i64 {
        self.header.modified_at.get()
    }

    pub fn descriptors_free(&self) -> i64 {
        self.header.descriptors_free.get()
    }

    pub fn descriptors_total(&self) -> i64 {
        self.header.descriptors_total.get()
    }

    pub fn descriptors_offset(&self) -> i64 {
        self.header.descriptors_offset.get()
    }

    pub fn descriptors_size(&self) -> i64 {
        self.header.descriptors_size.get()
    }

    pub fn data_offset(&self) -> i64 {
        self.header.data_offset.get()
    }

    pub fn data_size(&self) -> i64 {
        self.header.data_size.get()
    }

    /// Stable header byte stream fed to signing: launch script, magic,
    /// version and container ID
    pub fn header_integrity_reader(&self) -> Cursor<Vec<u8>> {
        let h = &self.header;
        let mut buf = Vec::with_capacity(
            desc::HDR_LAUNCH_LEN + desc::HDR_MAGIC_LEN + desc::HDR_VERSION_LEN + desc::HDR_ID_LEN,
        );
        buf.extend_from_slice(&h.launch_script);
        buf.extend_from_slice(&h.magic);
        buf.extend_from_slice(&h.version);
        buf.extend_from_slice(&h.id);
        Cursor::new(buf)
    }

    pub(crate) fn descriptor_view(&self, idx: usize) -> Descriptor<'_> {
        let raw = &self.descriptors[idx];
        let min = self
            .min_ids
            .get(&raw.group_id.get())
            .copied()
            .unwrap_or_else(|| raw.id.get());
        Descriptor {
            raw,
            relative_id: raw.id.get().wrapping_sub(min),
            store: self.store.as_ref(),
        }
    }

    pub(crate) fn index_of_id(&self, id: u32) -> Result<usize> {
        if id == 0 {
            return Err(Error::InvalidObjectId);
        }
        self.descriptors
            .iter()
            .position(|d| d.is_used() && d.id.get() == id)
            .ok_or(Error::ObjectNotFound)
    }

    pub(crate) fn primary_partition_index(&self) -> Option<usize> {
        self.descriptors.iter().position(|d| d.is_primary_partition())
    }

    pub(crate) fn max_used_id(&self) -> u32 {
        self.descriptors
            .iter()
            .filter(|d| d.is_used())
            .map(|d| d.id.get())
            .max()
            .unwrap_or(0)
    }

    /// Absolute end of the last used payload, or the data offset when the
    /// region is empty
    pub(crate) fn used_data_end(&self) -> i64 {
        self.descriptors
            .iter()
            .filter(|d| d.is_used())
            .map(|d| d.offset.get() + d.size_with_padding.get())
            .max()
            .unwrap_or_else(|| self.header.data_offset.get())
    }

    pub(crate) fn populate_min_ids(&mut self) {
        self.min_ids.clear();
        for rd in self.descriptors.iter().filter(|d| d.is_used()) {
            let entry = self
                .min_ids
                .entry(rd.group_id.get())
                .or_insert_with(|| rd.id.get());
            if rd.id.get() < *entry {
                *entry = rd.id.get();
            }
        }
    }
}

fn read_exact_or_malformed(
    store: &dyn DataStore,
    offset: u64,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    store.read_exact_at(offset, buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Malformed(format!("short {}", what))
        } else {
            Error::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use data_store::BufferStore;
    use std::io::Cursor as IoCursor;

    pub(crate) const FIXED_ID: &str = "3fa802cc-358b-45e3-bcc0-69dc7a45f9f8";
    /// 2020-05-22T19:30:59Z
    pub(crate) const FIXED_TIME: i64 = 1_590_175_859;

    pub(crate) fn store_bytes(store: &dyn DataStore) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; store.len()? as usize];
        store.read_exact_at(0, &mut buf)?;
        Ok(buf)
    }

    fn empty_opts() -> Result<CreateOpts<'static>> {
        Ok(CreateOpts::new()
            .deterministic()
            .with_id(Uuid::parse_str(FIXED_ID)?)
            .at_time(FIXED_TIME)
            .close_on_unload(false))
    }

    #[test]
    fn create_empty_deterministic() -> Result<()> {
        let image = FileImage::create_store(Box::new(BufferStore::new()), empty_opts()?)?;
        assert_eq!(image.id(), Uuid::parse_str(FIXED_ID)?);
        assert_eq!(image.version(), "01");
        assert_eq!(image.arch(), Arch::Unknown);
        assert_eq!(image.created_at(), FIXED_TIME);
        assert_eq!(image.descriptors_free(), 48);
        assert_eq!(image.descriptors_total(), 48);
        assert_eq!(image.descriptors_offset(), 4096);
        assert_eq!(image.descriptors_size(), 48 * 585);
        assert_eq!(image.data_offset(), 32768);
        assert_eq!(image.data_size(), 0);
        assert_eq!(image.launch_script(), DEFAULT_LAUNCH_SCRIPT);

        let store = image.unload()?.unwrap();
        let bytes = store_bytes(store.as_ref())?;
        assert_eq!(bytes.len(), 32768);
        assert_eq!(&bytes[32..42], b"SIF_MAGIC\0");
        assert_eq!(&bytes[42..45], b"01\0");
        assert_eq!(&bytes[45..48], b"00\0");
        assert_eq!(&bytes[48..64], Uuid::parse_str(FIXED_ID)?.as_bytes());
        assert_eq!(&bytes[64..72], &FIXED_TIME.to_le_bytes());
        assert_eq!(&bytes[120..128], &0i64.to_le_bytes());
        Ok(())
    }

    #[test]
    fn deterministic_create_is_reproducible() -> Result<()> {
        let make = || -> Result<Vec<u8>> {
            let input = DescriptorInput::new(DataType::Generic, IoCursor::new(vec![0xfa, 0xce]))
                .with_alignment(4)
                .with_name("payload")?;
            let image = FileImage::create_store(
                Box::new(BufferStore::new()),
                empty_opts()?.with_input(input),
            )?;
            store_bytes(image.unload()?.unwrap().as_ref())
        };
        assert_eq!(make()?, make()?);
        Ok(())
    }

    #[test]
    fn serialize_then_load_round_trips() -> Result<()> {
        let first = DescriptorInput::new(DataType::Deffile, IoCursor::new(b"bootstrap".to_vec()))
            .with_alignment(8)
            .with_name("image.def")?;
        let second = DescriptorInput::new(DataType::Generic, IoCursor::new(vec![1, 2, 3, 4, 5]))
            .with_alignment(8)
            .with_linked_id(1)?;
        let image = FileImage::create_store(
            Box::new(BufferStore::new()),
            empty_opts()?.with_input(first).with_input(second),
        )?;
        let bytes = store_bytes(image.unload()?.unwrap().as_ref())?;

        let loaded =
            FileImage::load_store(Box::new(BufferStore::from(bytes.clone())), LoadOpts::new())?;
        assert_eq!(loaded.id(), Uuid::parse_str(FIXED_ID)?);
        assert_eq!(loaded.descriptors_free(), 46);
        assert_eq!(loaded.data_size() + loaded.data_offset(), bytes.len() as i64);

        let d = loaded.get_descriptor(&[with_id(1)])?;
        assert_eq!(d.name(), "image.def");
        assert_eq!(d.data()?, b"bootstrap");
        let d = loaded.get_descriptor(&[with_id(2)])?;
        assert_eq!(d.linked_id(), (1, false));
        assert_eq!(d.data()?, vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn header_integrity_stream_is_stable_under_mutation() -> Result<()> {
        use std::io::Read;

        let mut image = FileImage::create_store(Box::new(BufferStore::new()), empty_opts()?)?;
        let mut before = Vec::new();
        image.header_integrity_reader().read_to_end(&mut before)?;
        assert_eq!(before.len(), 32 + 10 + 3 + 16);
        assert_eq!(&before[..DEFAULT_LAUNCH_SCRIPT.len()], DEFAULT_LAUNCH_SCRIPT.as_bytes());
        assert_eq!(&before[32..42], b"SIF_MAGIC\0");
        assert_eq!(&before[45..61], Uuid::parse_str(FIXED_ID)?.as_bytes());

        let input = DescriptorInput::new(DataType::Generic, IoCursor::new(vec![0xAA]))
            .with_alignment(4);
        image.add(input, AddOpts::new().at_time(FIXED_TIME + 5))?;
        let mut after = Vec::new();
        image.header_integrity_reader().read_to_end(&mut after)?;
        assert_eq!(after, before);
        Ok(())
    }

    #[test]
    fn load_rejects_bad_magic() -> Result<()> {
        let image = FileImage::create_store(Box::new(BufferStore::new()), empty_opts()?)?;
        let mut bytes = store_bytes(image.unload()?.unwrap().as_ref())?;
        bytes[33] ^= 0xFF;
        assert!(matches!(
            FileImage::load_store(Box::new(BufferStore::from(bytes)), LoadOpts::new()),
            Err(Error::Malformed(_))
        ));
        Ok(())
    }

    #[test]
    fn load_rejects_unknown_version() -> Result<()> {
        let image = FileImage::create_store(Box::new(BufferStore::new()), empty_opts()?)?;
        let mut bytes = store_bytes(image.unload()?.unwrap().as_ref())?;
        bytes[42..45].copy_from_slice(b"99\0");
        assert!(matches!(
            FileImage::load_store(Box::new(BufferStore::from(bytes)), LoadOpts::new()),
            Err(Error::Malformed(_))
        ));
        Ok(())
    }

    #[test]
    fn load_rejects_truncated_table() -> Result<()> {
        let image = FileImage::create_store(Box::new(BufferStore::new()), empty_opts()?)?;
        let mut bytes = store_bytes(image.unload()?.unwrap().as_ref())?;
        bytes.truncate(4096 + 100);
        assert!(matches!(
            FileImage::load_store(Box::new(BufferStore::from(bytes)), LoadOpts::new()),
            Err(Error::Malformed(_))
        ));
        Ok(())
    }

    #[test]
    fn load_rejects_free_count_mismatch() -> Result<()> {
        let image = FileImage::create_store(Box::new(BufferStore::new()), empty_opts()?)?;
        let mut bytes = store_bytes(image.unload()?.unwrap().as_ref())?;
        // header claims one slot in use while the table is empty
        bytes[80..88].copy_from_slice(&47i64.to_le_bytes());
        assert!(matches!(
            FileImage::load_store(Box::new(BufferStore::from(bytes)), LoadOpts::new()),
            Err(Error::Malformed(_))
        ));
        Ok(())
    }

    #[test]
    fn load_tolerates_unknown_data_type() -> Result<()> {
        let input = DescriptorInput::new(DataType::Generic, IoCursor::new(vec![5, 6]))
            .with_alignment(4)
            .with_metadata(Extra::Opaque(vec![0xBE, 0xEF]))?;
        let image = FileImage::create_store(
            Box::new(BufferStore::new()),
            empty_opts()?.with_input(input),
        )?;
        let mut bytes = store_bytes(image.unload()?.unwrap().as_ref())?;
        // rewrite the first slot's data-type sentinel to something unknown
        bytes[4096..4100].copy_from_slice(&0x7777i32.to_le_bytes());

        let loaded =
            FileImage::load_store(Box::new(BufferStore::from(bytes)), LoadOpts::new())?;
        let d = loaded.get_descriptor(&[with_id(1)])?;
        assert_eq!(d.data_type_code(), 0x7777);
        assert!(matches!(
            d.data_type(),
            Err(Error::UnexpectedDataType { got: 0x7777, .. })
        ));
        assert_eq!(&d.extra()[..2], &[0xBE, 0xEF]);
        assert_eq!(d.data()?, vec![5, 6]);
        Ok(())
    }

    #[test]
    fn create_rejects_too_many_inputs() -> Result<()> {
        let opts = CreateOpts::new()
            .deterministic()
            .with_descriptor_capacity(1)
            .with_input(DescriptorInput::new(DataType::Generic, IoCursor::new(vec![1])))
            .with_input(DescriptorInput::new(DataType::Generic, IoCursor::new(vec![2])));
        assert!(matches!(
            FileImage::create_store(Box::new(BufferStore::new()), opts),
            Err(Error::InsufficientCapacity)
        ));
        Ok(())
    }

    #[test]
    fn large_capacity_pushes_data_offset() -> Result<()> {
        let image = FileImage::create_store(
            Box::new(BufferStore::new()),
            CreateOpts::new()
                .deterministic()
                .with_descriptor_capacity(96)
                .close_on_unload(false),
        )?;
        let table_end = 4096 + 96 * 585;
        assert!(image.data_offset() >= table_end);
        assert_eq!(image.data_offset() % 4096, 0);
        Ok(())
    }

    #[test]
    fn create_and_load_via_path() -> Result<()> {
        let path = std::env::temp_dir().join(format!("rsif_image_{}.sif", std::process::id()));
        let input = DescriptorInput::new(DataType::Generic, IoCursor::new(vec![0xAB; 10]))
            .with_name("blob")?;
        let image = FileImage::create(&path, CreateOpts::new().with_input(input))?;
        image.unload()?;

        let loaded = FileImage::load(&path, LoadOpts::new().read_only(true))?;
        let d = loaded.get_descriptor(&[with_id(1)])?;
        assert_eq!(d.data()?, vec![0xAB; 10]);
        loaded.unload()?;
        std::fs::remove_file(path)?;
        Ok(())
    }
}
