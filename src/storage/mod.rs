pub mod blob;
pub mod block_file;
pub mod cache;
pub mod file_lock;
pub mod layout;
