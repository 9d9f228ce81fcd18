/// Mutating operations: add, delete, set-primary-partition, set-metadata.
///
/// Every operation keeps the header and descriptor table coherent and ends
/// in the persist sequence (payload bytes are written in place first, then
/// descriptor table, then header, then sync).
use log::debug;
use zerocopy::byteorder::{I32, I64, U32};
use zerocopy::FromBytes;

use crate::sif_lib::desc::{Extra, RawDescriptor, GROUP_MASK};
use crate::sif_lib::error::{Error, Result};
use crate::sif_lib::input::{resolve_time, AddOpts, DeleteOpts, DescriptorInput, SetOpts};
use crate::sif_lib::select::SelectorFn;
use crate::sif_lib::types::{Arch, PartType};
use crate::sif_lib::utils::align_up;
use crate::sif_lib::FileImage;

const MOVE_CHUNK: usize = 64 * 0x400;

impl FileImage {
    /// Place one payload in the data region and fill a free slot.
    /// Shared by create and add; the caller persists.
    pub(crate) fn write_data_object(
        &mut self,
        input: DescriptorInput<'_>,
        default_time: i64,
    ) -> Result<u32> {
        let slot = self
            .descriptors
            .iter()
            .position(|d| !d.is_used())
            .ok_or(Error::InsufficientCapacity)?;

        let DescriptorInput {
            data_type,
            mut reader,
            group_id,
            linked_id,
            linked_is_group,
            alignment,
            name,
            time,
            extra,
        } = input;

        let cur_end = self.header.data_offset.get() + self.header.data_size.get();
        let place_at = align_up(cur_end, alignment);
        let size = self.store.write_from(place_at as u64, reader.as_mut())? as i64;

        let id = self.next_id.max(self.max_used_id() + 1);
        self.next_id = id + 1;
        let t = time.unwrap_or(default_time);

        let mut rd = RawDescriptor::new_zeroed();
        rd.data_type = I32::new(i32::from(data_type));
        rd.used = 1;
        rd.id = U32::new(id);
        rd.group_id = U32::new(GROUP_MASK | group_id);
        rd.linked_id = U32::new(if linked_id == 0 {
            0
        } else if linked_is_group {
            GROUP_MASK | linked_id
        } else {
            linked_id
        });
        rd.offset = I64::new(place_at);
        rd.size = I64::new(size);
        rd.size_with_padding = I64::new(place_at + size - cur_end);
        rd.created_at = I64::new(t);
        rd.modified_at = I64::new(t);
        rd.name[..name.len()].copy_from_slice(name.as_bytes());
        rd.extra = extra.encode()?;

        let is_primary = rd.is_primary_partition();
        self.descriptors[slot] = rd;

        self.header.descriptors_free = I64::new(self.header.descriptors_free.get() - 1);
        self.header.data_size = I64::new(place_at + size - self.header.data_offset.get());
        if is_primary {
            if let Extra::Partition(p) = &extra {
                self.header.arch = p.arch.to_bytes();
            }
        }
        self.populate_min_ids();
        debug!(
            "placed object {} at {:#x} ({} bytes, {} padded)",
            id,
            place_at,
            size,
            place_at + size - cur_end
        );
        Ok(id)
    }

    /// Add one data object, returning its ID
    pub fn add(&mut self, input: DescriptorInput<'_>, opts: AddOpts) -> Result<u32> {
        if self.header.descriptors_free.get() <= 0 {
            return Err(Error::InsufficientCapacity);
        }
        if input.is_primary_partition() && self.primary_partition_index().is_some() {
            return Err(Error::PrimaryPartition);
        }

        let t = resolve_time(opts.time, opts.deterministic);
        let id = self.write_data_object(input, t)?;
        self.header.modified_at = I64::new(t);

        let end = (self.header.data_offset.get() + self.header.data_size.get()) as u64;
        if self.store.len()? < end {
            self.store.truncate(end)?;
        }
        self.flush()?;
        debug!("added object {}", id);
        Ok(id)
    }

    /// Delete the object with `id`. Without flags a tail object is
    /// reclaimed in place; `zero` scrubs the payload, `compact` reclaims
    /// the bytes wherever the object sits.
    pub fn delete(&mut self, id: u32, opts: DeleteOpts) -> Result<()> {
        let idx = self.index_of_id(id)?;
        let t = resolve_time(opts.time, opts.deterministic);

        let raw = self.descriptors[idx];
        let was_primary = raw.is_primary_partition();
        let data_offset = self.header.data_offset.get();
        let data_end = data_offset + self.header.data_size.get();
        let obj_end = raw.offset.get() + raw.size_with_padding.get();
        let is_tail = obj_end == data_end;

        if opts.zero {
            self.zero_region(raw.offset.get(), raw.size.get())?;
        }

        self.descriptors[idx] = RawDescriptor::new_zeroed();

        if opts.compact {
            if !is_tail {
                self.move_data_left(obj_end, data_end, raw.size_with_padding.get())?;
            }
            let new_end = self.used_data_end();
            self.header.data_size = I64::new(new_end - data_offset);
            self.store.truncate(new_end as u64)?;
        } else if !opts.zero && is_tail {
            // the tail gap is reclaimed even without an explicit compact
            let new_end = self.used_data_end();
            self.header.data_size = I64::new(new_end - data_offset);
            self.store.truncate(new_end as u64)?;
        }

        self.header.descriptors_free = I64::new(self.header.descriptors_free.get() + 1);
        self.header.modified_at = I64::new(t);
        if was_primary {
            self.header.arch = Arch::Unknown.to_bytes();
        }
        self.populate_min_ids();
        self.flush()?;
        debug!("deleted object {}", id);
        Ok(())
    }

    /// Delete every object matched by the selectors, highest ID first so
    /// offsets stay stable under non-compacting modes. Returns the number
    /// of deleted objects.
    pub fn delete_many(&mut self, fns: &[SelectorFn], opts: DeleteOpts) -> Result<usize> {
        let mut ids: Vec<u32> = self
            .get_descriptors(fns)?
            .iter()
            .map(|d| d.id())
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        for id in &ids {
            self.delete(*id, opts)?;
        }
        Ok(ids.len())
    }

    /// Make the object with `id` the primary system partition, downgrading
    /// the previous primary and mirroring the architecture into the header
    pub fn set_primary_partition(&mut self, id: u32, opts: SetOpts) -> Result<()> {
        let idx = self.index_of_id(id)?;
        let t = resolve_time(opts.time, opts.deterministic);

        let part = self.descriptor_view(idx).partition_metadata()?;
        if !matches!(part.part_type, PartType::System | PartType::PrimarySystem) {
            return Err(Error::UnexpectedPartitionType);
        }

        if let Some(cur) = self.primary_partition_index() {
            if cur != idx {
                let mut prev = self.descriptor_view(cur).partition_metadata()?;
                prev.part_type = PartType::System;
                self.descriptors[cur].extra = Extra::Partition(prev).encode()?;
            }
        }

        let mut upgraded = part;
        upgraded.part_type = PartType::PrimarySystem;
        self.descriptors[idx].extra = Extra::Partition(upgraded).encode()?;
        self.header.arch = part.arch.to_bytes();
        self.header.modified_at = I64::new(t);
        self.flush()?;
        debug!("object {} is now the primary system partition", id);
        Ok(())
    }

    /// Replace the typed metadata of the object with `id`
    pub fn set_metadata(&mut self, id: u32, extra: Extra, opts: SetOpts) -> Result<()> {
        let idx = self.index_of_id(id)?;
        let t = resolve_time(opts.time, opts.deterministic);

        let data_type = self.descriptors[idx].data_type.get();
        if !extra.compatible_with(data_type) {
            return Err(Error::UnexpectedDataType {
                got: data_type,
                want: extra.compatible_types().unwrap_or_default(),
            });
        }

        let was_primary = self.descriptors[idx].is_primary_partition();
        let becomes_primary =
            matches!(&extra, Extra::Partition(p) if p.part_type == PartType::PrimarySystem);
        if becomes_primary {
            if let Some(cur) = self.primary_partition_index() {
                if cur != idx {
                    return Err(Error::PrimaryPartition);
                }
            }
        }

        self.descriptors[idx].extra = extra.encode()?;
        self.descriptors[idx].modified_at = I64::new(t);
        if becomes_primary {
            if let Extra::Partition(p) = &extra {
                self.header.arch = p.arch.to_bytes();
            }
        } else if was_primary {
            self.header.arch = Arch::Unknown.to_bytes();
        }
        self.header.modified_at = I64::new(t);
        self.flush()
    }

    fn zero_region(&mut self, offset: i64, size: i64) -> Result<()> {
        let zeros = [0u8; MOVE_CHUNK];
        let mut pos = offset;
        let end = offset + size;
        while pos < end {
            let n = zeros.len().min((end - pos) as usize);
            self.store.write_all_at(pos as u64, &zeros[..n])?;
            pos += n as i64;
        }
        Ok(())
    }

    /// Move the byte range `[src_start, src_end)` left by `by` bytes and
    /// shift the offsets of the descriptors living there
    fn move_data_left(&mut self, src_start: i64, src_end: i64, by: i64) -> Result<()> {
        let mut chunk = vec![0u8; MOVE_CHUNK];
        let mut pos = src_start;
        while pos < src_end {
            let n = chunk.len().min((src_end - pos) as usize);
            self.store.read_exact_at(pos as u64, &mut chunk[..n])?;
            self.store.write_all_at((pos - by) as u64, &chunk[..n])?;
            pos += n as i64;
        }
        for rd in self.descriptors.iter_mut() {
            if rd.is_used() && rd.offset.get() >= src_start {
                rd.offset = I64::new(rd.offset.get() - by);
            }
        }
        Ok(())
    }
}
