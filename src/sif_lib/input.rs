/// Operation options and the new-object specification.
use std::io::Read;

use uuid::Uuid;

use crate::sif_lib::desc::{
    CryptoMessage, Extra, OciDigest, Partition, Sbom, Signature, DEFAULT_DESCRIPTOR_TOTAL,
    DEFAULT_LAUNCH_SCRIPT, DESC_NAME_LEN, ENTITY_LEN, HDR_LAUNCH_LEN,
};
use crate::sif_lib::error::{Error, Result};
use crate::sif_lib::types::{
    Arch, DataType, FormatType, FsType, HashType, MessageType, PartType, SbomFormat,
};
use crate::sif_lib::utils::{now_unix, system_page_size};

/// Pick the effective timestamp for one operation
pub(crate) fn resolve_time(explicit: Option<i64>, deterministic: bool) -> i64 {
    match explicit {
        Some(t) => t,
        None if deterministic => 0,
        None => now_unix(),
    }
}

/// Specification of one new data object
pub struct DescriptorInput<'a> {
    pub(crate) data_type: DataType,
    pub(crate) reader: Box<dyn Read + 'a>,
    pub(crate) group_id: u32,
    pub(crate) linked_id: u32,
    pub(crate) linked_is_group: bool,
    pub(crate) alignment: i64,
    pub(crate) name: String,
    pub(crate) time: Option<i64>,
    pub(crate) extra: Extra,
}

impl<'a> DescriptorInput<'a> {
    /// New object of `data_type` whose payload is streamed from `reader`.
    /// The object joins the default group (1) and is page-aligned unless
    /// overridden.
    pub fn new(data_type: DataType, reader: impl Read + 'a) -> Self {
        Self {
            data_type,
            reader: Box::new(reader),
            group_id: 1,
            linked_id: 0,
            linked_is_group: false,
            alignment: system_page_size(),
            name: String::new(),
            time: None,
            extra: Extra::Opaque(Vec::new()),
        }
    }

    pub fn with_group_id(mut self, group_id: u32) -> Result<Self> {
        if group_id == 0 {
            return Err(Error::InvalidGroupId);
        }
        self.group_id = group_id;
        Ok(self)
    }

    pub fn with_no_group(mut self) -> Self {
        self.group_id = 0;
        self
    }

    pub fn with_linked_id(mut self, id: u32) -> Result<Self> {
        if id == 0 {
            return Err(Error::InvalidObjectId);
        }
        self.linked_id = id;
        self.linked_is_group = false;
        Ok(self)
    }

    pub fn with_linked_group_id(mut self, group_id: u32) -> Result<Self> {
        if group_id == 0 {
            return Err(Error::InvalidGroupId);
        }
        self.linked_id = group_id;
        self.linked_is_group = true;
        Ok(self)
    }

    /// Byte alignment of the payload start; zero or one disables padding
    pub fn with_alignment(mut self, alignment: i64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_name(mut self, name: &str) -> Result<Self> {
        if name.len() > DESC_NAME_LEN {
            return Err(Error::NameTooLarge);
        }
        self.name = name.to_string();
        Ok(self)
    }

    pub fn at_time(mut self, t: i64) -> Self {
        self.time = Some(t);
        self
    }

    /// Attach typed metadata, enforcing data-type compatibility and the
    /// extra window size
    pub fn with_metadata(mut self, extra: Extra) -> Result<Self> {
        if !extra.compatible_with(i32::from(self.data_type)) {
            return Err(Error::UnexpectedDataType {
                got: i32::from(self.data_type),
                want: extra.compatible_types().unwrap_or_default(),
            });
        }
        extra.encode()?;
        self.extra = extra;
        Ok(self)
    }

    pub fn with_partition_metadata(
        self,
        fs_type: FsType,
        part_type: PartType,
        arch: Arch,
    ) -> Result<Self> {
        self.with_metadata(Extra::Partition(Partition {
            fs_type,
            part_type,
            arch,
        }))
    }

    pub fn with_signature_metadata(
        self,
        hash_type: HashType,
        entity: [u8; ENTITY_LEN],
    ) -> Result<Self> {
        self.with_metadata(Extra::Signature(Signature { hash_type, entity }))
    }

    pub fn with_crypto_message_metadata(
        self,
        format_type: FormatType,
        message_type: MessageType,
    ) -> Result<Self> {
        self.with_metadata(Extra::CryptoMessage(CryptoMessage {
            format_type,
            message_type,
        }))
    }

    pub fn with_sbom_metadata(self, format: SbomFormat) -> Result<Self> {
        self.with_metadata(Extra::Sbom(Sbom { format }))
    }

    pub fn with_oci_digest(self, algorithm: &str, hex: &str) -> Result<Self> {
        self.with_metadata(Extra::OciDigest(OciDigest {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        }))
    }

    pub(crate) fn is_primary_partition(&self) -> bool {
        matches!(&self.extra, Extra::Partition(p) if p.part_type == PartType::PrimarySystem)
    }

    pub(crate) fn partition_arch(&self) -> Option<Arch> {
        match &self.extra {
            Extra::Partition(p) => Some(p.arch),
            _ => None,
        }
    }
}

/// Options for creating a container
pub struct CreateOpts<'a> {
    pub(crate) id: Option<Uuid>,
    pub(crate) deterministic: bool,
    pub(crate) descriptor_capacity: i64,
    pub(crate) launch_script: String,
    pub(crate) time: Option<i64>,
    pub(crate) inputs: Vec<DescriptorInput<'a>>,
    pub(crate) close_on_unload: bool,
}

impl Default for CreateOpts<'_> {
    fn default() -> Self {
        Self {
            id: None,
            deterministic: false,
            descriptor_capacity: DEFAULT_DESCRIPTOR_TOTAL,
            launch_script: DEFAULT_LAUNCH_SCRIPT.to_string(),
            time: None,
            inputs: Vec::new(),
            close_on_unload: true,
        }
    }
}

impl<'a> CreateOpts<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit container UUID
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Zero UUID and zero timestamps unless explicitly overridden, so two
    /// identical invocations produce byte-identical files
    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }

    pub fn with_descriptor_capacity(mut self, total: i64) -> Self {
        self.descriptor_capacity = total;
        self
    }

    pub fn with_launch_script(mut self, script: &str) -> Result<Self> {
        if script.len() > HDR_LAUNCH_LEN {
            return Err(Error::LaunchScriptTooLarge);
        }
        self.launch_script = script.to_string();
        Ok(self)
    }

    pub fn at_time(mut self, t: i64) -> Self {
        self.time = Some(t);
        self
    }

    pub fn with_input(mut self, input: DescriptorInput<'a>) -> Self {
        self.inputs.push(input);
        self
    }

    /// Whether unload drops the backing store instead of handing it back
    pub fn close_on_unload(mut self, close: bool) -> Self {
        self.close_on_unload = close;
        self
    }
}

/// Options for loading an existing container
#[derive(Default, Debug, Clone, Copy)]
pub struct LoadOpts {
    pub(crate) read_only: bool,
    pub(crate) close_on_unload: bool,
}

impl LoadOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn close_on_unload(mut self, close: bool) -> Self {
        self.close_on_unload = close;
        self
    }
}

/// Options for adding one data object
#[derive(Default, Debug, Clone, Copy)]
pub struct AddOpts {
    pub(crate) time: Option<i64>,
    pub(crate) deterministic: bool,
}

impl AddOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_time(mut self, t: i64) -> Self {
        self.time = Some(t);
        self
    }

    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }
}

/// Options for deleting data objects
#[derive(Default, Debug, Clone, Copy)]
pub struct DeleteOpts {
    pub(crate) time: Option<i64>,
    pub(crate) deterministic: bool,
    pub(crate) zero: bool,
    pub(crate) compact: bool,
}

impl DeleteOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_time(mut self, t: i64) -> Self {
        self.time = Some(t);
        self
    }

    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }

    /// Overwrite the payload with zeros before deallocating
    pub fn zero(mut self) -> Self {
        self.zero = true;
        self
    }

    /// Reclaim the payload bytes, moving later objects leftward if needed
    pub fn compact(mut self) -> Self {
        self.compact = true;
        self
    }
}

/// Options for set-primary-partition and set-metadata
#[derive(Default, Debug, Clone, Copy)]
pub struct SetOpts {
    pub(crate) time: Option<i64>,
    pub(crate) deterministic: bool,
}

impl SetOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_time(mut self, t: i64) -> Self {
        self.time = Some(t);
        self
    }

    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }
}
