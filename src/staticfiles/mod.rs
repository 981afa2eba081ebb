mod cache;

pub use cache::{sanitize_path, CachedFile, FileCache};
