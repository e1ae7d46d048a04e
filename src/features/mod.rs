pub mod cache;
pub mod coordinates;
pub mod footprint;
pub mod metadata_store;
pub mod pdf;
pub mod placement;
pub mod signing;
pub mod stamp;
pub mod storage;
pub mod workflow;
