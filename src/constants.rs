//! Central constants for the on-disk posting list format
//!
//! Magic numbers, format versions and layout alignment used by the file-backed
//! store and the consolidator live here so both sides agree on one definition.

/// File format magic numbers used for file type identification
pub mod magic {
    /// On-disk inverted list file magic bytes
    pub const INVERTED_LISTS: &[u8; 4] = b"IVFL";

    /// Generic test magic bytes used in unit tests
    #[cfg(test)]
    pub const TEST_GENERIC: &[u8; 4] = b"TEST";
}

/// Format versions
pub mod version {
    /// Current on-disk inverted list format version
    pub const INVERTED_LISTS: u32 = 1;
}

/// Layout parameters of the on-disk store
pub mod layout {
    /// Bytes occupied by the identifier of every record
    pub const ID_SIZE: usize = 8;

    /// Alignment of the list data area and of every list region
    pub const DATA_ALIGNMENT: usize = 64;

    /// Initial capacity (entries) reserved for a list on its first append
    pub const DEFAULT_INITIAL_LIST_CAPACITY: usize = 16;

    /// Minimum growth step when the mapped file has to be extended
    pub const MIN_FILE_GROWTH: usize = 64 * 1024;
}

/// Round `value` up to the next multiple of `alignment` (a power of two)
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
