mod registry;

pub use registry::{LockCatalog, LockReference, CATALOG_PATH_ENV};
