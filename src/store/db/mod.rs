mod mem;

pub use mem::MemPersistence;
