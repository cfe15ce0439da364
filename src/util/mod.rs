pub mod arena;
pub mod bloom;
pub mod cache;
pub mod coding;
pub mod comparator;
pub mod compress;
pub mod crc32c;
pub mod hash;
pub mod random;
