pub mod archive;
pub mod query;
pub mod remarks;
pub mod status;
