//! Runtime page streaming
//!
//! Executes once per frame on the command-recording thread. Feedback
//! from the GPU culling pass drives which pages commit; the manager
//! answers with upload and fixup commands for the caller's GPU layer.

pub mod feedback;
pub mod manager;
pub mod slots;

pub use feedback::{MAX_STREAMING_REQUESTS, PageRequest, parse_feedback};
pub use manager::{
    ClusterFixupUpdate, FrameCommands, HierarchyFixupUpdate, PAGE_SLOT_BYTES, PageUpload,
    StreamingManager,
};
pub use slots::{PageKey, PageSlotList, SlotId};
