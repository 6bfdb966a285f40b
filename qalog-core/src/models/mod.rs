pub mod body;
pub mod log_entry;
pub mod remark;
pub mod session;

pub use body::Body;
pub use log_entry::{EventKind, LogEntry, NewLogEntry};
pub use remark::RemarkEntry;
pub use session::{session_id_for, SessionState};
