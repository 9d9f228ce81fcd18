/// Composable descriptor predicates and the query surface over them.
use crate::sif_lib::desc::Descriptor;
use crate::sif_lib::error::{Error, Result};
use crate::sif_lib::types::{DataType, PartType};
use crate::sif_lib::FileImage;

/// Pure predicate over one descriptor; selectors passed together must all
/// match
pub type SelectorFn = Box<dyn Fn(&Descriptor) -> Result<bool>>;

/// Match the object with the given ID
pub fn with_id(id: u32) -> SelectorFn {
    Box::new(move |d| {
        if id == 0 {
            return Err(Error::InvalidObjectId);
        }
        Ok(d.id() == id)
    })
}

/// Match objects belonging to the given group
pub fn with_group_id(group_id: u32) -> SelectorFn {
    Box::new(move |d| {
        if group_id == 0 {
            return Err(Error::InvalidGroupId);
        }
        Ok(d.group_id() == group_id)
    })
}

/// Match objects that opted out of grouping
pub fn with_no_group() -> SelectorFn {
    Box::new(|d| Ok(d.group_id() == 0))
}

/// Match objects linked to the given object
pub fn with_linked_id(id: u32) -> SelectorFn {
    Box::new(move |d| {
        if id == 0 {
            return Err(Error::InvalidObjectId);
        }
        Ok(d.linked_id() == (id, false))
    })
}

/// Match objects linked to the given group
pub fn with_linked_group_id(group_id: u32) -> SelectorFn {
    Box::new(move |d| {
        if group_id == 0 {
            return Err(Error::InvalidGroupId);
        }
        Ok(d.linked_id() == (group_id, true))
    })
}

/// Match objects of the given data type
pub fn with_data_type(data_type: DataType) -> SelectorFn {
    Box::new(move |d| Ok(d.data_type_code() == i32::from(data_type)))
}

/// Match partition objects of the given partition type
pub fn with_partition_type(part_type: PartType) -> SelectorFn {
    Box::new(move |d| Ok(d.raw.partition_type_code() == Some(i32::from(part_type))))
}

impl FileImage {
    /// All used descriptors matching every selector, in slot order
    pub fn get_descriptors(&self, fns: &[SelectorFn]) -> Result<Vec<Descriptor<'_>>> {
        let mut out = Vec::new();
        'slots: for idx in 0..self.descriptors.len() {
            if !self.descriptors[idx].is_used() {
                continue;
            }
            let d = self.descriptor_view(idx);
            for f in fns {
                if !f(&d)? {
                    continue 'slots;
                }
            }
            out.push(d);
        }
        Ok(out)
    }

    /// Exactly one matching descriptor
    pub fn get_descriptor(&self, fns: &[SelectorFn]) -> Result<Descriptor<'_>> {
        let mut found = None;
        'slots: for idx in 0..self.descriptors.len() {
            if !self.descriptors[idx].is_used() {
                continue;
            }
            let d = self.descriptor_view(idx);
            for f in fns {
                if !f(&d)? {
                    continue 'slots;
                }
            }
            if found.is_some() {
                return Err(Error::MultipleObjectsFound);
            }
            found = Some(d);
        }
        found.ok_or(Error::ObjectNotFound)
    }

    /// Visit used descriptors in slot order; the callback returns true to
    /// stop, and any error short-circuits the walk
    pub fn with_descriptors<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Descriptor) -> Result<bool>,
    {
        for idx in 0..self.descriptors.len() {
            if !self.descriptors[idx].is_used() {
                continue;
            }
            if f(&self.descriptor_view(idx))? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::Result;
    use data_store::BufferStore;

    use super::*;
    use crate::sif_lib::input::{CreateOpts, DescriptorInput};
    use crate::sif_lib::types::{Arch, FsType};

    fn sample_image() -> Result<FileImage> {
        let partition =
            DescriptorInput::new(DataType::Partition, Cursor::new(b"rootfs".to_vec()))
                .with_alignment(4)
                .with_partition_metadata(FsType::Squashfs, PartType::PrimarySystem, Arch::Amd64)?;
        let signature =
            DescriptorInput::new(DataType::Signature, Cursor::new(b"sig".to_vec()))
                .with_alignment(4)
                .with_linked_id(1)?;
        let orphan = DescriptorInput::new(DataType::Generic, Cursor::new(b"blob".to_vec()))
            .with_alignment(4)
            .with_no_group();
        let opts = CreateOpts::new()
            .deterministic()
            .with_input(partition)
            .with_input(signature)
            .with_input(orphan);
        Ok(FileImage::create_store(Box::new(BufferStore::new()), opts)?)
    }

    #[test]
    fn zero_ids_error_out_of_queries() -> Result<()> {
        let image = sample_image()?;
        assert!(matches!(
            image.get_descriptor(&[with_id(0)]),
            Err(Error::InvalidObjectId)
        ));
        assert!(matches!(
            image.get_descriptors(&[with_group_id(0)]),
            Err(Error::InvalidGroupId)
        ));
        Ok(())
    }

    #[test]
    fn singular_query_outcomes() -> Result<()> {
        let image = sample_image()?;
        assert!(matches!(
            image.get_descriptor(&[with_id(9)]),
            Err(Error::ObjectNotFound)
        ));
        assert!(matches!(
            image.get_descriptor(&[with_group_id(1)]),
            Err(Error::MultipleObjectsFound)
        ));
        assert_eq!(image.get_descriptor(&[with_no_group()])?.id(), 3);
        Ok(())
    }

    #[test]
    fn selectors_compose_with_and() -> Result<()> {
        let image = sample_image()?;
        let hits = image.get_descriptors(&[
            with_group_id(1),
            with_data_type(DataType::Signature),
        ])?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), 2);

        let hits = image.get_descriptors(&[
            with_no_group(),
            with_data_type(DataType::Signature),
        ])?;
        assert!(hits.is_empty());
        Ok(())
    }

    #[test]
    fn link_and_partition_selectors() -> Result<()> {
        let image = sample_image()?;
        assert_eq!(image.get_descriptor(&[with_linked_id(1)])?.id(), 2);
        assert_eq!(
            image
                .get_descriptor(&[with_partition_type(PartType::PrimarySystem)])?
                .id(),
            1
        );
        assert!(image.get_descriptors(&[with_linked_group_id(1)])?.is_empty());
        Ok(())
    }

    #[test]
    fn with_descriptors_short_circuits() -> Result<()> {
        let image = sample_image()?;
        let mut seen = Vec::new();
        image.with_descriptors(|d| {
            seen.push(d.id());
            Ok(d.id() == 2)
        })?;
        assert_eq!(seen, vec![1, 2]);

        let err = image.with_descriptors(|_| Err(Error::InvalidObjectId));
        assert!(matches!(err, Err(Error::InvalidObjectId)));
        Ok(())
    }
}
