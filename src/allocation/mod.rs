//! Upload connections and their pending changes

pub mod change;
pub mod committer;

pub use change::{
    collector_id, AllocationChange, AllocationChangeCollector, Operation, UploadFormData,
};
pub use committer::{AllocationLocks, WriteCommitter};
