//! Consolidation of several posting stores into one file
//!
//! [`OnDiskConsolidator`] streams the lists of any number of stores, in memory or
//! on disk, into a fresh list file. For every list the entries of source 0 come
//! first, then those of source 1, and so on. The output is written to a temporary
//! file next to the destination, fsynced, and renamed over the destination only
//! once complete, so a failure at any point leaves the sources and any existing
//! destination file as they were.

use crate::config::OnDiskConfig;
use crate::constants::layout;
use crate::error::IvfError;
use crate::memory::StandardHeader;
use crate::ondisk_store::{region_bytes, sealed_header, ListLayout, ListSlot, OnDiskPostingStore};
use crate::posting_store::{check_id_shift, check_store_compatible, PostingStore};
use crate::structures::{shifted_id, Idx};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Builder of consolidated on-disk posting stores
pub struct OnDiskConsolidator;

impl OnDiskConsolidator {
    /// Consolidate `sources` into a new store at `output_path`
    ///
    /// With `shift_ids` the identifiers of source `i` are offset by the total entry
    /// count of sources `0..i`, which yields the same identifiers as merging the
    /// sources pairwise into source 0 with shifting enabled. Returns the opened
    /// store, which owns its file, and the number of entries written.
    pub fn consolidate(
        sources: &[&dyn PostingStore],
        shift_ids: bool,
        output_path: &Path,
    ) -> Result<(OnDiskPostingStore, usize), IvfError> {
        Self::consolidate_with_config(sources, shift_ids, output_path, OnDiskConfig::default())
    }

    pub fn consolidate_with_config(
        sources: &[&dyn PostingStore],
        shift_ids: bool,
        output_path: &Path,
        config: OnDiskConfig,
    ) -> Result<(OnDiskPostingStore, usize), IvfError> {
        config.validate()?;
        Self::validate_sources(sources, output_path)?;

        let bases = if shift_ids {
            Self::shift_bases(sources)?
        } else {
            vec![0; sources.len()]
        };

        let parent = match output_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).map_err(|e| IvfError::from(e).with_file_context(parent, "create output directory"))?;

        let mut temp = NamedTempFile::new_in(parent)
            .map_err(|e| IvfError::from(e).with_file_context(parent, "create temporary consolidation file"))?;

        let total = Self::write_lists(temp.as_file_mut(), sources, &bases)
            .map_err(|e| e.with_file_context(temp.path(), "write consolidated lists"))?;

        temp.persist(output_path)
            .map_err(|e| IvfError::from(e.error).with_file_context(output_path, "persist consolidated store"))?;

        let mut store = OnDiskPostingStore::open_with_config(output_path, config)?;
        store.set_owns_file(true);

        info!(
            path = %output_path.display(),
            sources = sources.len(),
            entries = total,
            shift_ids,
            "consolidated posting stores"
        );
        Ok((store, total))
    }

    /// Offset of every source: the entry count of all sources before it
    ///
    /// Every shifted identifier is checked here, before the output file exists.
    fn shift_bases(sources: &[&dyn PostingStore]) -> Result<Vec<Idx>, IvfError> {
        let mut bases = Vec::with_capacity(sources.len());
        let mut running: Idx = 0;
        for source in sources {
            check_id_shift(*source, running)?;
            bases.push(running);
            running = Idx::try_from(source.total_entries())
                .ok()
                .and_then(|total| running.checked_add(total))
                .ok_or_else(|| {
                    IvfError::invalid_input(
                        "sources",
                        "entry counts exceed the identifier range",
                        "Consolidate fewer entries or disable identifier shifting",
                    )
                })?;
        }
        Ok(bases)
    }

    fn validate_sources(sources: &[&dyn PostingStore], output_path: &Path) -> Result<(), IvfError> {
        let Some(first) = sources.first() else {
            return Err(IvfError::invalid_input(
                "sources",
                "no posting stores to consolidate",
                "Pass at least one source store",
            ));
        };
        for source in &sources[1..] {
            check_store_compatible(*first, *source)?;
        }

        let output = std::fs::canonicalize(output_path).ok();
        for (i, source) in sources.iter().enumerate() {
            if let Some(path) = source.backing_path() {
                let same = path == output_path || (output.is_some() && std::fs::canonicalize(path).ok() == output);
                if same {
                    return Err(IvfError::invalid_input(
                        "output_path",
                        format!("{} is the backing file of source {}", output_path.display(), i),
                        "Consolidate into a new file",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Stream every list into `file`, then write the slot table and sealed header
    fn write_lists(file: &mut File, sources: &[&dyn PostingStore], bases: &[Idx]) -> Result<usize, IvfError> {
        let nlist = sources[0].nlist();
        let code_size = sources[0].code_size();
        let mut list_layout = ListLayout::new(nlist, code_size);
        let record_size = list_layout.record_size();
        let data_offset = list_layout.data_offset as usize;

        let mut slots = vec![ListSlot::default(); nlist];
        let mut total = 0usize;
        let mut position = data_offset;

        let mut writer = BufWriter::new(&mut *file);
        writer.write_all(&vec![0u8; data_offset])?;

        for (list_no, slot) in slots.iter_mut().enumerate() {
            let count = sources
                .iter()
                .map(|source| source.list_len(list_no))
                .sum::<Result<usize, IvfError>>()?;
            if count == 0 {
                continue;
            }

            for (source, &base) in sources.iter().zip(bases) {
                let list = source.read_list(list_no)?;
                for (i, &id) in list.ids.iter().enumerate() {
                    writer.write_all(&shifted_id(id, base)?.to_le_bytes())?;
                    writer.write_all(list.code(i, code_size))?;
                }
            }

            let region = region_bytes(count, record_size);
            let padding = region - count * record_size;
            if padding > 0 {
                writer.write_all(&[0u8; layout::DATA_ALIGNMENT][..padding])?;
            }

            *slot = ListSlot {
                offset: position as u64,
                count: count as u64,
                capacity: count as u64,
            };
            position += region;
            total += count;
        }

        writer.flush()?;
        drop(writer);

        list_layout.end_offset = position as u64;
        list_layout.total_entries = total as u64;

        let mut covered = Vec::with_capacity(list_layout.checksummed_len());
        covered.extend_from_slice(bytemuck::bytes_of(&list_layout));
        covered.extend_from_slice(bytemuck::cast_slice(&slots));
        let header = sealed_header(&list_layout, &covered);

        file.seek(SeekFrom::Start(0))?;
        file.write_all(bytemuck::bytes_of(&header))?;
        file.seek(SeekFrom::Start(StandardHeader::SIZE as u64))?;
        file.write_all(&covered)?;
        file.sync_all()?;

        debug!(nlist, entries = total, bytes = position, "wrote consolidated list file");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array_store::ArrayPostingStore;
    use crate::merger::merge_posting_lists;
    use crate::test_utils::TestEnvironment;

    fn store_with(nlist: usize, entries: &[(usize, Idx, u8)]) -> ArrayPostingStore {
        let mut store = ArrayPostingStore::new(nlist, 4);
        for &(list_no, id, byte) in entries {
            store.append_entry(list_no, id, &[byte; 4]).unwrap();
        }
        store
    }

    #[test]
    fn test_consolidate_concatenates_in_source_order() {
        let env = TestEnvironment::new("test_consolidate_concatenates_in_source_order");
        let a = store_with(3, &[(0, 0, 1), (2, 1, 2)]);
        let b = store_with(3, &[(0, 0, 3), (1, 1, 4), (0, 2, 5)]);

        let path = env.path().join("merged.ivf");
        let (store, total) = OnDiskConsolidator::consolidate(&[&a, &b], true, &path).unwrap();

        assert_eq!(total, 5);
        assert_eq!(store.total_entries(), 5);
        assert!(store.owns_file());
        assert_eq!(store.read_list(0).unwrap().ids, vec![0, 2, 4]);
        assert_eq!(store.read_list(0).unwrap().codes, vec![1, 1, 1, 1, 3, 3, 3, 3, 5, 5, 5, 5]);
        assert_eq!(store.read_list(1).unwrap().ids, vec![3]);
        assert_eq!(store.read_list(2).unwrap().ids, vec![1]);
    }

    #[test]
    fn test_consolidate_without_shift() {
        let env = TestEnvironment::new("test_consolidate_without_shift");
        let a = store_with(2, &[(1, 10, 0)]);
        let b = store_with(2, &[(1, 20, 0)]);

        let (store, _) = OnDiskConsolidator::consolidate(&[&a, &b], false, &env.path().join("m.ivf")).unwrap();
        assert_eq!(store.read_list(1).unwrap().ids, vec![10, 20]);
    }

    #[test]
    fn test_matches_pairwise_merge() {
        let env = TestEnvironment::new("test_matches_pairwise_merge");
        let sources = [
            store_with(4, &[(0, 0, 1), (3, 1, 2), (0, 2, 3)]),
            store_with(4, &[(1, 0, 4)]),
            store_with(4, &[]),
            store_with(4, &[(3, 0, 5), (3, 1, 6), (2, 2, 7)]),
        ];

        let mut pairwise = sources[0].clone();
        let mut base = sources[0].total_entries() as Idx;
        for source in &sources[1..] {
            merge_posting_lists(&mut pairwise, source, base).unwrap();
            base += source.total_entries() as Idx;
        }

        let refs: Vec<&dyn PostingStore> = sources.iter().map(|s| s as &dyn PostingStore).collect();
        let (store, total) = OnDiskConsolidator::consolidate(&refs, true, &env.path().join("c.ivf")).unwrap();

        assert_eq!(total, pairwise.total_entries());
        for list_no in 0..4 {
            assert_eq!(store.read_list(list_no).unwrap(), pairwise.read_list(list_no).unwrap());
        }
    }

    #[test]
    fn test_mixed_source_kinds() {
        let env = TestEnvironment::new("test_mixed_source_kinds");
        let mut on_disk = OnDiskPostingStore::create(env.path().join("shard0.ivf"), 2, 4).unwrap();
        on_disk.append_entry(0, 0, &[9; 4]).unwrap();
        let in_memory = store_with(2, &[(0, 0, 8), (1, 1, 7)]);

        let (store, total) =
            OnDiskConsolidator::consolidate(&[&on_disk, &in_memory], true, &env.path().join("out.ivf")).unwrap();
        assert_eq!(total, 3);
        assert_eq!(store.read_list(0).unwrap().ids, vec![0, 1]);
        assert_eq!(store.read_list(1).unwrap().ids, vec![2]);
        // Source still readable and unchanged
        assert_eq!(on_disk.total_entries(), 1);
    }

    #[test]
    fn test_reopen_after_consolidation() {
        let env = TestEnvironment::new("test_reopen_after_consolidation");
        let path = env.path().join("reopen.ivf");
        let a = store_with(3, &[(0, 0, 1), (1, 1, 2), (1, 2, 3)]);
        let b = store_with(3, &[(2, 0, 4)]);

        let expected: Vec<_> = {
            let (mut store, _) = OnDiskConsolidator::consolidate(&[&a, &b], true, &path).unwrap();
            store.set_owns_file(false);
            (0..3).map(|l| store.read_list(l).unwrap()).collect()
        };

        let reopened = OnDiskPostingStore::open_read_only(&path).unwrap();
        for (list_no, list) in expected.iter().enumerate() {
            assert_eq!(&reopened.read_list(list_no).unwrap(), list);
        }
    }

    #[test]
    fn test_consolidated_store_accepts_appends() {
        let env = TestEnvironment::new("test_consolidated_store_accepts_appends");
        let a = store_with(2, &[(0, 0, 1), (0, 1, 2)]);

        let (mut store, _) = OnDiskConsolidator::consolidate(&[&a], true, &env.path().join("grow.ivf")).unwrap();
        store.append_entry(0, 2, &[3; 4]).unwrap();
        store.append_entry(1, 3, &[4; 4]).unwrap();
        assert_eq!(store.read_list(0).unwrap().ids, vec![0, 1, 2]);
        assert_eq!(store.read_list(1).unwrap().ids, vec![3]);
    }

    #[test]
    fn test_rejects_incompatible_sources() {
        let env = TestEnvironment::new("test_rejects_incompatible_sources");
        let a = ArrayPostingStore::new(2, 4);
        let b = ArrayPostingStore::new(3, 4);
        let c = ArrayPostingStore::new(2, 8);
        let path = env.path().join("bad.ivf");

        assert!(matches!(
            OnDiskConsolidator::consolidate(&[&a, &b], true, &path),
            Err(IvfError::ConfigurationMismatch { .. })
        ));
        assert!(matches!(
            OnDiskConsolidator::consolidate(&[&a, &c], true, &path),
            Err(IvfError::ConfigurationMismatch { .. })
        ));
        assert!(matches!(
            OnDiskConsolidator::consolidate(&[], true, &path),
            Err(IvfError::InvalidInput { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_rejects_source_file_as_output() {
        let env = TestEnvironment::new("test_rejects_source_file_as_output");
        let path = env.path().join("self.ivf");
        let mut on_disk = OnDiskPostingStore::create(&path, 2, 4).unwrap();
        on_disk.append_entry(1, 5, &[1; 4]).unwrap();

        let result = OnDiskConsolidator::consolidate(&[&on_disk], true, &path);
        assert!(matches!(result, Err(IvfError::InvalidInput { .. })));
        assert_eq!(on_disk.read_list(1).unwrap().ids, vec![5]);
    }

    #[test]
    fn test_shift_overflow_rejected_before_writing() {
        let env = TestEnvironment::new("test_shift_overflow_rejected_before_writing");
        let path = env.path().join("overflow.ivf");
        let a = store_with(2, &[(0, 5, 1)]);
        let b = store_with(2, &[(1, Idx::MAX, 2)]);

        let result = OnDiskConsolidator::consolidate(&[&a, &b], true, &path);
        assert!(matches!(result, Err(IvfError::InvalidInput { ref field, .. }) if field == "ids"));
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(env.path()).unwrap().count(), 0);

        // Without shifting the identifiers are copied as they are
        let (store, total) = OnDiskConsolidator::consolidate(&[&a, &b], false, &path).unwrap();
        assert_eq!(total, 2);
        assert_eq!(store.read_list(1).unwrap().ids, vec![Idx::MAX]);
    }

    #[test]
    fn test_replaces_existing_output_and_leaves_no_temp_files() {
        let env = TestEnvironment::new("test_replaces_existing_output_and_leaves_no_temp_files");
        let path = env.path().join("out.ivf");
        std::fs::write(&path, b"stale").unwrap();

        let a = store_with(2, &[(1, 0, 1)]);
        let (store, _) = OnDiskConsolidator::consolidate(&[&a], false, &path).unwrap();
        assert_eq!(store.read_list(1).unwrap().ids, vec![0]);

        let entries: Vec<_> = std::fs::read_dir(env.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
