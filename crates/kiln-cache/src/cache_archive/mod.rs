mod create;
mod restore;

pub use create::CacheWriter;
pub use restore::CacheReader;
