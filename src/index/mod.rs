pub mod index_file;
pub mod key;

pub use index_file::IndexFile;
