//! File-backed posting store
//!
//! [`OnDiskPostingStore`] keeps every inverted list in one memory-mapped file so
//! lists can be read by random access without loading the store into memory.
//!
//! # File Format
//!
//! ```text
//! [StandardHeader: 64 bytes]   magic "IVFL", version, checksum, timestamps
//! [ListLayout: 64 bytes]       nlist, code_size, table/data/end offsets, total entries
//! [ListSlot; nlist]            (offset, count, capacity) per list, 24 bytes each
//! [padding to 64 bytes]
//! [list regions ...]           `capacity` records of (i64 LE id, code_size byte code)
//! ```
//!
//! Regions are 64-byte aligned and need not be ordered by list number. Appending
//! to a full list relocates it to a region twice as large, reusing freed regions
//! first-fit before extending the file. The checksum covers the layout and the
//! slot table; it is refreshed by [`OnDiskPostingStore::sync`] and verified on open.

use crate::config::OnDiskConfig;
use crate::constants::{align_up, layout, magic, version};
use crate::error::IvfError;
use crate::memory::{MemoryMappedFile, StandardHeader};
use crate::posting_store::{check_batch, check_code, check_list, check_truncate, PostingStore, StoreKind};
use crate::structures::{Idx, PostingList};
use bytemuck::{Pod, Zeroable};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Geometry of the list file, stored right after the standard header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ListLayout {
    pub nlist: u64,
    pub code_size: u64,
    pub table_offset: u64,
    pub data_offset: u64,
    /// One past the last byte of the highest allocated region
    pub end_offset: u64,
    pub total_entries: u64,
    pub reserved: [u8; 16],
}

// SAFETY: repr(C) with only u64 and byte array fields, no padding
unsafe impl Pod for ListLayout {}
// SAFETY: all-zero bytes are a valid ListLayout
unsafe impl Zeroable for ListLayout {}

/// Location and fill of one list's region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ListSlot {
    pub offset: u64,
    pub count: u64,
    pub capacity: u64,
}

// SAFETY: repr(C) with three u64 fields, no padding
unsafe impl Pod for ListSlot {}
// SAFETY: all-zero bytes are a valid (empty) ListSlot
unsafe impl Zeroable for ListSlot {}

impl ListLayout {
    pub const SIZE: usize = std::mem::size_of::<ListLayout>();

    /// Offset of the slot table in every list file
    pub const TABLE_OFFSET: usize = StandardHeader::SIZE + Self::SIZE;

    /// Layout of an empty store
    pub fn new(nlist: usize, code_size: usize) -> Self {
        let data_offset = Self::data_offset_for(nlist) as u64;
        Self {
            nlist: nlist as u64,
            code_size: code_size as u64,
            table_offset: Self::TABLE_OFFSET as u64,
            data_offset,
            end_offset: data_offset,
            total_entries: 0,
            reserved: [0; 16],
        }
    }

    /// First byte available for list regions when the table holds `nlist` slots
    pub fn data_offset_for(nlist: usize) -> usize {
        align_up(Self::TABLE_OFFSET + nlist * ListSlot::SIZE, layout::DATA_ALIGNMENT)
    }

    /// Bytes of one `(id, code)` record
    pub fn record_size(&self) -> usize {
        layout::ID_SIZE + self.code_size as usize
    }

    /// Bytes covered by the header checksum: layout plus slot table
    pub fn checksummed_len(&self) -> usize {
        Self::SIZE + self.nlist as usize * ListSlot::SIZE
    }

    fn validate(&self, file_len: usize) -> Result<(), IvfError> {
        if self.nlist == 0 || self.code_size == 0 {
            return Err(IvfError::Corruption(format!(
                "Invalid list geometry: nlist {} code_size {}",
                self.nlist, self.code_size
            )));
        }
        if self.table_offset != Self::TABLE_OFFSET as u64 {
            return Err(IvfError::Corruption(format!(
                "Slot table at offset {} (expected {})",
                self.table_offset,
                Self::TABLE_OFFSET
            )));
        }
        let expected_data = Self::data_offset_for(self.nlist as usize) as u64;
        if self.data_offset != expected_data {
            return Err(IvfError::Corruption(format!(
                "Data area at offset {} (expected {})",
                self.data_offset, expected_data
            )));
        }
        if self.end_offset < self.data_offset || self.end_offset > file_len as u64 {
            return Err(IvfError::Corruption(format!(
                "End offset {} outside data area [{}, {}]",
                self.end_offset, self.data_offset, file_len
            )));
        }
        Ok(())
    }
}

impl ListSlot {
    pub const SIZE: usize = std::mem::size_of::<ListSlot>();
}

/// Bytes reserved for a region of `capacity` records
pub fn region_bytes(capacity: usize, record_size: usize) -> usize {
    align_up(capacity * record_size, layout::DATA_ALIGNMENT)
}

/// Header for a list file whose layout and slot table are `covered`
pub(crate) fn sealed_header(layout: &ListLayout, covered: &[u8]) -> StandardHeader {
    let mut header = StandardHeader::new_without_checksum(magic::INVERTED_LISTS, version::INVERTED_LISTS, layout.data_offset);
    header.update_checksum(covered);
    header
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRegion {
    offset: usize,
    len: usize,
}

/// Memory-mapped posting store
#[derive(Debug)]
pub struct OnDiskPostingStore {
    path: PathBuf,
    mmap: MemoryMappedFile,
    header: StandardHeader,
    layout: ListLayout,
    slots: Vec<ListSlot>,
    /// Unused regions inside the data area, sorted by offset and coalesced
    free: Vec<FreeRegion>,
    config: OnDiskConfig,
    owns_file: bool,
    dirty: bool,
}

impl OnDiskPostingStore {
    /// Create an empty store at `path` with default growth settings
    pub fn create<P: AsRef<Path>>(path: P, nlist: usize, code_size: usize) -> Result<Self, IvfError> {
        Self::create_with_config(path, nlist, code_size, OnDiskConfig::default())
    }

    /// Create an empty store at `path`, truncating any existing file
    ///
    /// The returned store owns its file: releasing it deletes the file.
    pub fn create_with_config<P: AsRef<Path>>(
        path: P,
        nlist: usize,
        code_size: usize,
        config: OnDiskConfig,
    ) -> Result<Self, IvfError> {
        let path = path.as_ref();
        config.validate()?;
        if nlist == 0 {
            return Err(IvfError::invalid_input("nlist", "must be greater than 0", "Create the store with at least one list"));
        }
        if code_size == 0 {
            return Err(IvfError::invalid_input(
                "code_size",
                "must be greater than 0",
                "Use the code size of the codec that fills the store",
            ));
        }

        let layout = ListLayout::new(nlist, code_size);
        let mmap = MemoryMappedFile::create(path, layout.data_offset as usize)
            .map_err(|e| e.with_file_context(path, "create posting store"))?;

        let mut store = Self {
            path: path.to_path_buf(),
            mmap,
            header: StandardHeader::new_without_checksum(magic::INVERTED_LISTS, version::INVERTED_LISTS, layout.data_offset),
            layout,
            slots: vec![ListSlot::default(); nlist],
            free: Vec::new(),
            config,
            owns_file: true,
            dirty: true,
        };
        store.sync()?;

        debug!(path = %path.display(), nlist, code_size, "created on-disk posting store");
        Ok(store)
    }

    /// Open an existing store for reading and appending
    ///
    /// The caller keeps ownership of the file: releasing the store leaves it in place.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IvfError> {
        Self::open_with_config(path, OnDiskConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: OnDiskConfig) -> Result<Self, IvfError> {
        config.validate()?;
        let path = path.as_ref();
        let mmap = MemoryMappedFile::open_read_write(path).map_err(|e| e.with_file_context(path, "open posting store"))?;
        Self::from_mapping(path, mmap, config).map_err(|e| e.with_file_context(path, "open posting store"))
    }

    /// Open an existing store read-only; appends fail with [`IvfError::ReadOnly`]
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, IvfError> {
        let path = path.as_ref();
        let mmap = MemoryMappedFile::open_read_only(path).map_err(|e| e.with_file_context(path, "open posting store"))?;
        Self::from_mapping(path, mmap, OnDiskConfig::default())
            .map_err(|e| e.with_file_context(path, "open posting store"))
    }

    fn from_mapping(path: &Path, mmap: MemoryMappedFile, config: OnDiskConfig) -> Result<Self, IvfError> {
        if mmap.len() < ListLayout::TABLE_OFFSET {
            return Err(IvfError::Corruption(format!(
                "File is {} bytes, smaller than the {} byte header",
                mmap.len(),
                ListLayout::TABLE_OFFSET
            )));
        }

        let header: StandardHeader = mmap.read_at(0)?;
        header.validate_magic(magic::INVERTED_LISTS)?;
        header.validate_version(version::INVERTED_LISTS, version::INVERTED_LISTS)?;
        header.validate_structure()?;

        let layout: ListLayout = mmap.read_at(StandardHeader::SIZE)?;
        layout.validate(mmap.len())?;
        if header.data_offset != layout.data_offset {
            return Err(IvfError::Corruption(format!(
                "Header data offset {} disagrees with layout data offset {}",
                header.data_offset, layout.data_offset
            )));
        }
        header.validate_checksum(mmap.read_bytes(StandardHeader::SIZE, layout.checksummed_len())?)?;

        let nlist = layout.nlist as usize;
        let slots: Vec<ListSlot> = (0..nlist)
            .map(|list_no| mmap.read_at(ListLayout::TABLE_OFFSET + list_no * ListSlot::SIZE))
            .collect::<Result<_, _>>()?;
        let free = Self::rebuild_free_list(&layout, &slots)?;

        let total: u64 = slots.iter().map(|slot| slot.count).sum();
        if total != layout.total_entries {
            return Err(IvfError::Corruption(format!(
                "Slot counts sum to {} but layout records {} entries",
                total, layout.total_entries
            )));
        }

        debug!(
            path = %path.display(),
            nlist,
            entries = total,
            free_regions = free.len(),
            read_only = mmap.is_read_only(),
            "opened on-disk posting store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            header,
            layout,
            slots,
            free,
            config,
            owns_file: false,
            dirty: false,
        })
    }

    /// Validate every slot region and derive the gaps between them
    fn rebuild_free_list(layout: &ListLayout, slots: &[ListSlot]) -> Result<Vec<FreeRegion>, IvfError> {
        let record_size = layout.record_size();
        let mut regions = Vec::with_capacity(slots.len());

        for (list_no, slot) in slots.iter().enumerate() {
            if slot.count > slot.capacity {
                return Err(IvfError::Corruption(format!(
                    "List {} holds {} entries but has capacity {}",
                    list_no, slot.count, slot.capacity
                )));
            }
            if slot.capacity == 0 {
                continue;
            }
            let offset = slot.offset as usize;
            let len = region_bytes(slot.capacity as usize, record_size);
            if offset < layout.data_offset as usize
                || offset % layout::DATA_ALIGNMENT != 0
                || offset + len > layout.end_offset as usize
            {
                return Err(IvfError::Corruption(format!(
                    "List {} region [{}, {}) lies outside the data area [{}, {})",
                    list_no,
                    offset,
                    offset + len,
                    layout.data_offset,
                    layout.end_offset
                )));
            }
            regions.push(FreeRegion { offset, len });
        }

        regions.sort_by_key(|region| region.offset);

        let mut free = Vec::new();
        let mut cursor = layout.data_offset as usize;
        for region in &regions {
            if region.offset < cursor {
                return Err(IvfError::Corruption(format!(
                    "Overlapping list regions at offset {}",
                    region.offset
                )));
            }
            if region.offset > cursor {
                free.push(FreeRegion {
                    offset: cursor,
                    len: region.offset - cursor,
                });
            }
            cursor = region.offset + region.len;
        }
        if cursor < layout.end_offset as usize {
            free.push(FreeRegion {
                offset: cursor,
                len: layout.end_offset as usize - cursor,
            });
        }
        Ok(free)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.mmap.is_read_only()
    }

    /// Whether releasing this store deletes its file
    pub fn owns_file(&self) -> bool {
        self.owns_file
    }

    pub fn set_owns_file(&mut self, owns_file: bool) {
        self.owns_file = owns_file;
    }

    /// Slot table entry of `list_no`
    pub fn list_slot(&self, list_no: usize) -> Result<ListSlot, IvfError> {
        check_list(list_no, self.slots.len())?;
        Ok(self.slots[list_no])
    }

    pub fn layout(&self) -> &ListLayout {
        &self.layout
    }

    /// Current length of the backing file in bytes
    pub fn file_len(&self) -> usize {
        self.mmap.len()
    }

    /// Bytes inside the data area not used by any list region
    pub fn free_bytes(&self) -> usize {
        self.free.iter().map(|region| region.len).sum()
    }

    /// Write the layout, refresh the header checksum and flush the mapping
    pub fn sync(&mut self) -> Result<(), IvfError> {
        if self.mmap.is_read_only() || !self.dirty {
            return Ok(());
        }
        self.mmap.write_at(StandardHeader::SIZE, &self.layout)?;
        let covered = self.mmap.read_bytes(StandardHeader::SIZE, self.layout.checksummed_len())?;
        self.header.data_offset = self.layout.data_offset;
        self.header.update_for_modification(covered);
        self.mmap.write_at(0, &self.header)?;
        self.mmap
            .sync()
            .map_err(|e| e.with_file_context(&self.path, "sync posting store"))?;
        self.dirty = false;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), IvfError> {
        if self.mmap.is_read_only() {
            return Err(IvfError::ReadOnly(format!(
                "posting store {} was opened read-only",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn write_slot(&mut self, list_no: usize) -> Result<(), IvfError> {
        let slot = self.slots[list_no];
        self.mmap
            .write_at(ListLayout::TABLE_OFFSET + list_no * ListSlot::SIZE, &slot)
    }

    fn record_position(&self, list_no: usize, offset: usize) -> Result<usize, IvfError> {
        check_list(list_no, self.slots.len())?;
        let slot = &self.slots[list_no];
        let len = slot.count as usize;
        if offset >= len {
            return Err(IvfError::EntryOutOfRange { list_no, offset, len });
        }
        Ok(slot.offset as usize + offset * self.layout.record_size())
    }

    /// Make room for at least `needed` entries in `list_no`
    fn ensure_capacity(&mut self, list_no: usize, needed: usize) -> Result<(), IvfError> {
        let slot = self.slots[list_no];
        let capacity = slot.capacity as usize;
        if needed <= capacity {
            return Ok(());
        }

        let new_capacity = needed.max(capacity * 2).max(self.config.initial_list_capacity);
        let record_size = self.layout.record_size();
        let new_len = region_bytes(new_capacity, record_size);
        let new_offset = self.allocate(new_len)?;

        let live = slot.count as usize * record_size;
        if live > 0 {
            self.mmap.copy_within(slot.offset as usize, live, new_offset)?;
        }
        if capacity > 0 {
            self.release_region(slot.offset as usize, region_bytes(capacity, record_size));
        }

        debug!(list_no, from = capacity, to = new_capacity, offset = new_offset, "relocated inverted list");

        self.slots[list_no].offset = new_offset as u64;
        self.slots[list_no].capacity = new_capacity as u64;
        self.write_slot(list_no)
    }

    /// Reserve `len` bytes in the data area, first-fit from the free list
    fn allocate(&mut self, len: usize) -> Result<usize, IvfError> {
        if let Some(pos) = self.free.iter().position(|region| region.len >= len) {
            let region = &mut self.free[pos];
            let offset = region.offset;
            region.offset += len;
            region.len -= len;
            if region.len == 0 {
                self.free.remove(pos);
            }
            return Ok(offset);
        }

        let offset = self.layout.end_offset as usize;
        let end = offset + len;
        if end > self.mmap.len() {
            let current = self.mmap.len();
            let grown = end
                .max(current * 2)
                .max(current + self.config.min_file_growth);
            debug!(path = %self.path.display(), from = current, to = grown, "growing posting store file");
            self.mmap
                .resize(grown)
                .map_err(|e| e.with_file_context(&self.path, "grow posting store"))?;
        }
        self.layout.end_offset = end as u64;
        Ok(offset)
    }

    /// Return a region to the free list, coalescing neighbours and trimming the tail
    fn release_region(&mut self, offset: usize, len: usize) {
        let pos = self.free.partition_point(|region| region.offset < offset);
        self.free.insert(pos, FreeRegion { offset, len });

        if pos + 1 < self.free.len() && self.free[pos].offset + self.free[pos].len == self.free[pos + 1].offset {
            self.free[pos].len += self.free[pos + 1].len;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].offset + self.free[pos - 1].len == self.free[pos].offset {
            self.free[pos - 1].len += self.free[pos].len;
            self.free.remove(pos);
        }

        if let Some(last) = self.free.last().copied() {
            if last.offset + last.len == self.layout.end_offset as usize {
                self.layout.end_offset = last.offset as u64;
                self.free.pop();
            }
        }
    }

    fn encode_records(ids: &[Idx], codes: &[u8], code_size: usize) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(ids.len() * (layout::ID_SIZE + code_size));
        for (i, id) in ids.iter().enumerate() {
            buffer.extend_from_slice(&id.to_le_bytes());
            buffer.extend_from_slice(&codes[i * code_size..(i + 1) * code_size]);
        }
        buffer
    }
}

fn decode_id(bytes: &[u8]) -> Idx {
    let mut raw = [0u8; layout::ID_SIZE];
    raw.copy_from_slice(&bytes[..layout::ID_SIZE]);
    Idx::from_le_bytes(raw)
}

impl PostingStore for OnDiskPostingStore {
    fn nlist(&self) -> usize {
        self.layout.nlist as usize
    }

    fn code_size(&self) -> usize {
        self.layout.code_size as usize
    }

    fn list_len(&self, list_no: usize) -> Result<usize, IvfError> {
        check_list(list_no, self.slots.len())?;
        Ok(self.slots[list_no].count as usize)
    }

    fn entry_id(&self, list_no: usize, offset: usize) -> Result<Idx, IvfError> {
        let position = self.record_position(list_no, offset)?;
        Ok(decode_id(self.mmap.read_bytes(position, layout::ID_SIZE)?))
    }

    fn entry_code(&self, list_no: usize, offset: usize) -> Result<&[u8], IvfError> {
        let position = self.record_position(list_no, offset)?;
        self.mmap.read_bytes(position + layout::ID_SIZE, self.code_size())
    }

    fn append_entry(&mut self, list_no: usize, id: Idx, code: &[u8]) -> Result<usize, IvfError> {
        self.append_entries(list_no, std::slice::from_ref(&id), code)
    }

    fn append_entries(&mut self, list_no: usize, ids: &[Idx], codes: &[u8]) -> Result<usize, IvfError> {
        self.ensure_writable()?;
        check_list(list_no, self.slots.len())?;
        let code_size = self.code_size();
        if ids.len() == 1 {
            check_code(codes, code_size)?;
        } else {
            check_batch(code_size, ids, codes)?;
        }

        let first = self.slots[list_no].count as usize;
        if ids.is_empty() {
            return Ok(first);
        }
        self.ensure_capacity(list_no, first + ids.len())?;

        let position = self.slots[list_no].offset as usize + first * self.layout.record_size();
        let records = Self::encode_records(ids, codes, code_size);
        self.mmap.write_bytes(position, &records)?;

        self.slots[list_no].count += ids.len() as u64;
        self.layout.total_entries += ids.len() as u64;
        self.write_slot(list_no)?;
        self.dirty = true;
        Ok(first)
    }

    fn truncate_list(&mut self, list_no: usize, len: usize) -> Result<(), IvfError> {
        self.ensure_writable()?;
        check_list(list_no, self.slots.len())?;
        let count = self.slots[list_no].count as usize;
        check_truncate(list_no, len, count)?;
        if len == count {
            return Ok(());
        }

        // The region keeps its capacity; dropped records are overwritten by later appends
        self.slots[list_no].count = len as u64;
        self.layout.total_entries -= (count - len) as u64;
        self.write_slot(list_no)?;
        self.dirty = true;
        Ok(())
    }

    fn read_list(&self, list_no: usize) -> Result<PostingList, IvfError> {
        check_list(list_no, self.slots.len())?;
        let slot = self.slots[list_no];
        let code_size = self.code_size();
        let record_size = self.layout.record_size();
        let count = slot.count as usize;

        let mut list = PostingList::with_capacity(count, code_size);
        if count == 0 {
            return Ok(list);
        }
        let region = self.mmap.read_bytes(slot.offset as usize, count * record_size)?;
        for record in region.chunks_exact(record_size) {
            list.push(decode_id(record), &record[layout::ID_SIZE..]);
        }
        Ok(list)
    }

    fn total_entries(&self) -> usize {
        self.layout.total_entries as usize
    }

    fn kind(&self) -> StoreKind {
        StoreKind::OnDisk
    }

    fn backing_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn sync(&mut self) -> Result<(), IvfError> {
        OnDiskPostingStore::sync(self)
    }

    fn release(mut self: Box<Self>) -> Result<(), IvfError> {
        if !self.owns_file {
            self.sync()?;
            debug!(path = %self.path.display(), "released on-disk posting store, file kept");
            return Ok(());
        }

        let path = self.path.clone();
        self.dirty = false;
        drop(self);
        std::fs::remove_file(&path).map_err(|e| IvfError::from(e).with_file_context(&path, "delete released posting store"))?;
        debug!(path = %path.display(), "released on-disk posting store and deleted its file");
        Ok(())
    }
}

impl Drop for OnDiskPostingStore {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!(path = %self.path.display(), error = %e, "failed to sync posting store on drop");
        }
    }
}
