//! coursebuild daemon: socket server + build dispatcher.

mod error;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod service;

pub use error::DaemonError;
pub use protocol::{
    request_publish, request_status, request_stop, request_trigger, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{init_tracing, run, start_blocking};
pub use service::{all_course_status, course_status, open_orchestrator, CourseStatus};
