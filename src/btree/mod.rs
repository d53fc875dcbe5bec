pub mod cursor;
pub mod node;
pub mod record;
pub mod tree;
