//! RatoNet Protocol Core
//!
//! Types shared by the field agent and the relay: link identity and quality
//! metrics, the native multi-link frame format, and in-band link reports.

pub mod frame;
pub mod link;
pub mod report;

pub use frame::{
    Frame, FrameAuth, FrameError, FrameHeader, FrameKind, NullAuth, FIXED_HEADER_SIZE,
    FRAME_MAGIC, FRAME_VERSION, MAX_STREAMER_ID_LEN, TAG_SIZE,
};
pub use link::{LinkKind, LinkMetrics, LinkState};
pub use report::{LinkReport, LinkReportEntry, REPORT_ENTRY_SIZE};
