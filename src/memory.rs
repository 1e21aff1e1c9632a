//! Memory-mapped file abstractions
//!
//! Safe wrappers over memmap2 used by the file-backed posting store: bounds and
//! alignment checked typed access, raw byte access for variable-size records,
//! in-place region moves and growth of the underlying file.
//!
//! # Key Components
//!
//! - [`MemoryMappedFile`]: wrapper around a read-only or read-write mapping
//! - [`StandardHeader`]: 64-byte file header with magic, version, timestamps and
//!   a CRC32 checksum over a caller-chosen data range
//!
//! ```rust
//! use ivfmerge::memory::{MemoryMappedFile, StandardHeader};
//! use tempfile::TempDir;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let temp_dir = TempDir::new()?;
//! let path = temp_dir.path().join("example.dat");
//!
//! let mut mmf = MemoryMappedFile::create(&path, 1024)?;
//! let mut header = StandardHeader::new_without_checksum(b"DEMO", 1, StandardHeader::SIZE as u64);
//! mmf.write_bytes(StandardHeader::SIZE, &[7u8; 16])?;
//! header.update_checksum(mmf.read_bytes(StandardHeader::SIZE, 16)?);
//! mmf.write_at(0, &header)?;
//! mmf.sync()?;
//!
//! let reopened = MemoryMappedFile::open_read_only(&path)?;
//! let header: StandardHeader = reopened.read_at(0)?;
//! header.validate_magic(b"DEMO")?;
//! header.validate_checksum(reopened.read_bytes(StandardHeader::SIZE, 16)?)?;
//! # Ok(())
//! # }
//! ```

use crate::error::IvfError;
use bytemuck::{Pod, Zeroable};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Memory-mapped file wrapper providing checked access to the mapped bytes
#[derive(Debug)]
pub struct MemoryMappedFile {
    mmap: MmapVariant,
    file: File,
    len: usize,
}

#[derive(Debug)]
enum MmapVariant {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// Standardized file header
///
/// # Layout
/// ```text
/// Offset  | Size | Field         | Description
/// --------|------|---------------|------------------------------------------
/// 0       | 4    | magic         | File type identifier
/// 4       | 4    | version       | Format version number
/// 8       | 4    | header_size   | Size of this header in bytes
/// 12      | 4    | flags         | Format specific flags
/// 16      | 8    | data_offset   | Offset of the data section from file start
/// 24      | 4    | checksum      | CRC32 of normalized header + covered data
/// 28      | 4    | _padding      | Zero
/// 32      | 8    | created_at    | Creation timestamp (Unix epoch microseconds)
/// 40      | 8    | modified_at   | Last modification timestamp
/// 48      | 16   | reserved      | Zero
/// Total   | 64   |               |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct StandardHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub header_size: u32,
    pub flags: u32,
    pub data_offset: u64,
    pub checksum: u32,
    pub _padding: u32,
    pub created_at: u64,
    pub modified_at: u64,
    pub reserved: [u8; 16],
}

// SAFETY: repr(C), every field is Pod and the explicit padding leaves no uninitialized bytes
unsafe impl Pod for StandardHeader {}
// SAFETY: all-zero bytes are a valid StandardHeader
unsafe impl Zeroable for StandardHeader {}

fn mapping_error(action: &str, path: &Path, e: impl std::fmt::Display) -> IvfError {
    IvfError::MemoryMapping(format!("Failed to {} {}: {}", action, path.display(), e))
}

impl MemoryMappedFile {
    /// Create a new zero-filled, read-write mapped file of `size` bytes
    ///
    /// Parent directories are created when missing; an existing file is truncated.
    pub fn create<P: AsRef<Path>>(path: P, size: usize) -> Result<Self, IvfError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| mapping_error("create parent directories for", path, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| mapping_error("create file", path, e))?;

        file.set_len(size as u64)
            .map_err(|e| mapping_error("set file size for", path, e))?;

        // SAFETY: the file was just created and is owned by this process for the mapping's lifetime
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| mapping_error("map", path, e))?;

        Ok(Self {
            mmap: MmapVariant::ReadWrite(mmap),
            file,
            len: size,
        })
    }

    /// Open an existing file in read-only mode
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, IvfError> {
        let path = path.as_ref();

        let file = File::open(path).map_err(|e| mapping_error("open file", path, e))?;
        let len = file
            .metadata()
            .map_err(|e| mapping_error("read metadata of", path, e))?
            .len() as usize;

        // SAFETY: callers must not truncate the file while it is mapped
        let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|e| mapping_error("map read-only", path, e))?;

        Ok(Self {
            mmap: MmapVariant::ReadOnly(mmap),
            file,
            len,
        })
    }

    /// Open an existing file in read-write mode
    pub fn open_read_write<P: AsRef<Path>>(path: P) -> Result<Self, IvfError> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| mapping_error("open file for read-write", path, e))?;
        let len = file
            .metadata()
            .map_err(|e| mapping_error("read metadata of", path, e))?
            .len() as usize;

        // SAFETY: callers must not truncate the file while it is mapped
        let mmap =
            unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| mapping_error("map read-write", path, e))?;

        Ok(Self {
            mmap: MmapVariant::ReadWrite(mmap),
            file,
            len,
        })
    }

    /// Length of the mapped file in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if the mapping is read-only
    pub fn is_read_only(&self) -> bool {
        matches!(self.mmap, MmapVariant::ReadOnly(_))
    }

    /// The mapped memory as a byte slice
    pub fn as_slice(&self) -> &[u8] {
        match &self.mmap {
            MmapVariant::ReadOnly(mmap) => mmap.as_ref(),
            MmapVariant::ReadWrite(mmap) => mmap.as_ref(),
        }
    }

    /// The mapped memory as a mutable byte slice; fails on read-only mappings
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8], IvfError> {
        match &mut self.mmap {
            MmapVariant::ReadOnly(_) => Err(IvfError::MemoryMapping(
                "Cannot get mutable reference to read-only mapping".to_string(),
            )),
            MmapVariant::ReadWrite(mmap) => Ok(mmap.as_mut()),
        }
    }

    fn check_range(&self, op: &str, offset: usize, size: usize) -> Result<(), IvfError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(IvfError::MemoryMapping(format!(
                "{} at offset {} with size {} exceeds file length {}",
                op, offset, size, self.len
            ))),
        }
    }

    fn check_alignment<T>(offset: usize) -> Result<(), IvfError> {
        if offset % std::mem::align_of::<T>() != 0 {
            return Err(IvfError::MemoryMapping(format!(
                "Offset {} is not properly aligned for type {} (requires {} byte alignment)",
                offset,
                std::any::type_name::<T>(),
                std::mem::align_of::<T>()
            )));
        }
        Ok(())
    }

    /// Read a Pod value at `offset` after bounds and alignment checks
    pub fn read_at<T: Pod>(&self, offset: usize) -> Result<T, IvfError> {
        let size = std::mem::size_of::<T>();
        self.check_range("Read", offset, size)?;
        Self::check_alignment::<T>(offset)?;
        Ok(bytemuck::pod_read_unaligned(&self.as_slice()[offset..offset + size]))
    }

    /// Write a Pod value at `offset` after bounds and alignment checks
    pub fn write_at<T: Pod>(&mut self, offset: usize, value: &T) -> Result<(), IvfError> {
        let size = std::mem::size_of::<T>();
        self.check_range("Write", offset, size)?;
        Self::check_alignment::<T>(offset)?;
        self.as_mut_slice()?[offset..offset + size].copy_from_slice(bytemuck::bytes_of(value));
        Ok(())
    }

    /// Borrow `len` raw bytes starting at `offset`
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8], IvfError> {
        self.check_range("Read bytes", offset, len)?;
        Ok(&self.as_slice()[offset..offset + len])
    }

    /// Copy `bytes` into the mapping at `offset`
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), IvfError> {
        self.check_range("Write bytes", offset, bytes.len())?;
        self.as_mut_slice()?[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Move `len` bytes from `src` to `dst` inside the mapping; ranges may overlap
    pub fn copy_within(&mut self, src: usize, len: usize, dst: usize) -> Result<(), IvfError> {
        self.check_range("Copy source", src, len)?;
        self.check_range("Copy destination", dst, len)?;
        self.as_mut_slice()?.copy_within(src..src + len, dst);
        Ok(())
    }

    /// Resize the underlying file and remap it
    ///
    /// Pending writes are flushed first. Contents are preserved up to the smaller
    /// of the old and new sizes; new bytes read as zero.
    pub fn resize(&mut self, new_size: usize) -> Result<(), IvfError> {
        let MmapVariant::ReadWrite(current) = &self.mmap else {
            return Err(IvfError::MemoryMapping(
                "Cannot resize read-only memory mapping".to_string(),
            ));
        };
        current
            .flush()
            .map_err(|e| IvfError::MemoryMapping(format!("Failed to flush before resize: {}", e)))?;

        self.file
            .set_len(new_size as u64)
            .map_err(|e| IvfError::MemoryMapping(format!("Failed to resize file to {} bytes: {}", new_size, e)))?;

        // SAFETY: the file handle is owned by self and was just resized to new_size
        let remapped = unsafe { MmapOptions::new().map_mut(&self.file) }
            .map_err(|e| IvfError::MemoryMapping(format!("Failed to create new memory mapping: {}", e)))?;

        self.mmap = MmapVariant::ReadWrite(remapped);
        self.len = new_size;
        Ok(())
    }

    /// Flush mapped changes to disk; a no-op for read-only mappings
    pub fn sync(&self) -> Result<(), IvfError> {
        match &self.mmap {
            MmapVariant::ReadOnly(_) => Ok(()),
            MmapVariant::ReadWrite(mmap) => mmap
                .flush()
                .map_err(|e| IvfError::MemoryMapping(format!("Failed to sync memory mapping: {}", e))),
        }
    }
}

impl StandardHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = std::mem::size_of::<StandardHeader>();

    /// Current timestamp in microseconds since Unix epoch
    fn current_timestamp() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }

    /// Create a header with fresh timestamps and a zero checksum
    pub fn new_without_checksum(magic: &[u8; 4], version: u32, data_offset: u64) -> Self {
        let now = Self::current_timestamp();
        Self {
            magic: *magic,
            version,
            header_size: Self::SIZE as u32,
            flags: 0,
            data_offset,
            checksum: 0,
            _padding: 0,
            created_at: now,
            modified_at: now,
            reserved: [0; 16],
        }
    }

    pub fn validate_magic(&self, expected_magic: &[u8; 4]) -> Result<(), IvfError> {
        if &self.magic != expected_magic {
            return Err(IvfError::Corruption(format!(
                "Magic bytes mismatch: expected {:?}, found {:?}",
                expected_magic, self.magic
            )));
        }
        Ok(())
    }

    pub fn validate_version(&self, min_version: u32, max_version: u32) -> Result<(), IvfError> {
        if self.version < min_version {
            return Err(IvfError::Corruption(format!(
                "Version {} is too old (minimum supported: {})",
                self.version, min_version
            )));
        }
        if self.version > max_version {
            return Err(IvfError::Corruption(format!(
                "Version {} is too new (maximum supported: {})",
                self.version, max_version
            )));
        }
        Ok(())
    }

    /// Validate header size, data offset and timestamp ordering
    pub fn validate_structure(&self) -> Result<(), IvfError> {
        if self.header_size != Self::SIZE as u32 {
            return Err(IvfError::Corruption(format!(
                "Invalid header size: expected {}, found {}",
                Self::SIZE,
                self.header_size
            )));
        }
        if self.data_offset < Self::SIZE as u64 {
            return Err(IvfError::Corruption(format!(
                "Invalid data offset: {} is less than header size {}",
                self.data_offset,
                Self::SIZE
            )));
        }
        if self.created_at > self.modified_at {
            return Err(IvfError::Corruption(format!(
                "Creation timestamp {} is after modification timestamp {}",
                self.created_at, self.modified_at
            )));
        }
        Ok(())
    }

    pub fn validate_checksum(&self, data: &[u8]) -> Result<(), IvfError> {
        let expected = self.compute_checksum(data);
        if self.checksum != expected {
            return Err(IvfError::Corruption(format!(
                "Checksum mismatch: expected {}, found {}",
                expected, self.checksum
            )));
        }
        Ok(())
    }

    /// Refresh the modification timestamp and checksum
    pub fn update_for_modification(&mut self, data: &[u8]) {
        self.modified_at = Self::current_timestamp().max(self.created_at);
        self.update_checksum(data);
    }

    pub fn update_checksum(&mut self, data: &[u8]) {
        self.checksum = self.compute_checksum(data);
    }

    /// CRC32 over the header with checksum and timestamps zeroed, followed by `data`
    fn compute_checksum(&self, data: &[u8]) -> u32 {
        let mut normalized = *self;
        normalized.checksum = 0;
        normalized.created_at = 0;
        normalized.modified_at = 0;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(bytemuck::bytes_of(&normalized));
        hasher.update(data);
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::magic;
    use tempfile::TempDir;

    #[test]
    fn test_create_memory_mapped_file() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("test.dat");

        let mmf = MemoryMappedFile::create(&file_path, 1024).unwrap();
        assert_eq!(mmf.len(), 1024);
        assert!(!mmf.is_empty());
        assert!(!mmf.is_read_only());
        assert!(mmf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_write_operations() {
        let temp_dir = TempDir::new().unwrap();
        let mut mmf = MemoryMappedFile::create(temp_dir.path().join("rw.dat"), 1024).unwrap();

        let value: u64 = 0x1234567890ABCDEF;
        mmf.write_at(8, &value).unwrap();
        let read_value: u64 = mmf.read_at(8).unwrap();
        assert_eq!(value, read_value);
    }

    #[test]
    fn test_byte_operations() {
        let temp_dir = TempDir::new().unwrap();
        let mut mmf = MemoryMappedFile::create(temp_dir.path().join("bytes.dat"), 128).unwrap();

        mmf.write_bytes(3, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(mmf.read_bytes(3, 5).unwrap(), &[1, 2, 3, 4, 5]);

        mmf.copy_within(3, 5, 100).unwrap();
        assert_eq!(mmf.read_bytes(100, 5).unwrap(), &[1, 2, 3, 4, 5]);

        // Overlapping move
        mmf.copy_within(3, 5, 5).unwrap();
        assert_eq!(mmf.read_bytes(3, 7).unwrap(), &[1, 2, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_bounds_checking() {
        let temp_dir = TempDir::new().unwrap();
        let mut mmf = MemoryMappedFile::create(temp_dir.path().join("bounds.dat"), 64).unwrap();

        let result: Result<u64, _> = mmf.read_at(60);
        assert!(result.is_err());
        assert!(mmf.write_at(64, &42u64).is_err());
        assert!(mmf.read_bytes(60, 8).is_err());
        assert!(mmf.write_bytes(usize::MAX, &[1]).is_err());
        assert!(mmf.copy_within(0, 32, 40).is_err());
    }

    #[test]
    fn test_alignment_checking() {
        let temp_dir = TempDir::new().unwrap();
        let mut mmf = MemoryMappedFile::create(temp_dir.path().join("align.dat"), 1024).unwrap();

        let result: Result<u64, _> = mmf.read_at(1);
        assert!(result.is_err());
        assert!(mmf.write_at(1, &42u64).is_err());
    }

    #[test]
    fn test_file_resize_preserves_contents() {
        let temp_dir = TempDir::new().unwrap();
        let mut mmf = MemoryMappedFile::create(temp_dir.path().join("resize.dat"), 512).unwrap();

        mmf.write_at(0, &0xDEADBEEFu64).unwrap();
        mmf.resize(4096).unwrap();
        assert_eq!(mmf.len(), 4096);

        let read_value: u64 = mmf.read_at(0).unwrap();
        assert_eq!(read_value, 0xDEADBEEF);
        assert!(mmf.read_bytes(512, 3584).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_only_mapping() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("ro.dat");
        {
            let mut mmf = MemoryMappedFile::create(&file_path, 64).unwrap();
            mmf.write_at(0, &42u32).unwrap();
            mmf.sync().unwrap();
        }

        let mut mmf = MemoryMappedFile::open_read_only(&file_path).unwrap();
        assert!(mmf.is_read_only());
        let value: u32 = mmf.read_at(0).unwrap();
        assert_eq!(value, 42);

        assert!(mmf.write_at(0, &7u32).is_err());
        assert!(mmf.resize(128).is_err());
        assert!(mmf.sync().is_ok());
    }

    #[test]
    fn test_open_read_write_sees_existing_data() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("rw_open.dat");
        {
            let mut mmf = MemoryMappedFile::create(&file_path, 64).unwrap();
            mmf.write_bytes(0, b"hello").unwrap();
            mmf.sync().unwrap();
        }

        let mut mmf = MemoryMappedFile::open_read_write(&file_path).unwrap();
        assert_eq!(mmf.read_bytes(0, 5).unwrap(), b"hello");
        mmf.write_bytes(0, b"j").unwrap();
        assert_eq!(mmf.read_bytes(0, 5).unwrap(), b"jello");
    }

    #[test]
    fn test_parent_directory_creation() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b").join("lists.dat");

        let mmf = MemoryMappedFile::create(&nested, 64).unwrap();
        assert_eq!(mmf.len(), 64);
        assert!(nested.exists());
    }

    #[test]
    fn test_standard_header_size() {
        assert_eq!(StandardHeader::SIZE, 64);
        assert_eq!(std::mem::align_of::<StandardHeader>(), 8);
    }

    #[test]
    fn test_standard_header_validation() {
        let header = StandardHeader::new_without_checksum(magic::TEST_GENERIC, 2, 128);

        assert!(header.validate_magic(magic::TEST_GENERIC).is_ok());
        assert!(header.validate_magic(magic::INVERTED_LISTS).is_err());
        assert!(header.validate_version(1, 2).is_ok());
        assert!(header.validate_version(3, 4).is_err());
        assert!(header.validate_version(0, 1).is_err());
        assert!(header.validate_structure().is_ok());

        let mut bad = header;
        bad.data_offset = 8;
        assert!(bad.validate_structure().is_err());

        let mut bad = header;
        bad.created_at = bad.modified_at + 1;
        assert!(bad.validate_structure().is_err());
    }

    #[test]
    fn test_standard_header_checksum() {
        let data = vec![9u8; 200];
        let mut header = StandardHeader::new_without_checksum(magic::TEST_GENERIC, 1, 64);
        header.update_checksum(&data);

        assert!(header.validate_checksum(&data).is_ok());

        let mut changed = data.clone();
        changed[150] = 0;
        assert!(header.validate_checksum(&changed).is_err());

        // Timestamps are excluded from the checksum
        let mut touched = header;
        touched.update_for_modification(&data);
        assert_eq!(touched.checksum, header.checksum);
        assert!(touched.modified_at >= header.modified_at);
    }

    #[test]
    fn test_standard_header_round_trip_through_mapping() {
        let temp_dir = TempDir::new().unwrap();
        let mut mmf = MemoryMappedFile::create(temp_dir.path().join("hdr.dat"), 256).unwrap();

        let mut header = StandardHeader::new_without_checksum(magic::INVERTED_LISTS, 1, 64);
        header.update_checksum(mmf.read_bytes(64, 192).unwrap());
        mmf.write_at(0, &header).unwrap();

        let read: StandardHeader = mmf.read_at(0).unwrap();
        assert_eq!(read, header);
        assert!(read.validate_checksum(mmf.read_bytes(64, 192).unwrap()).is_ok());
    }
}
