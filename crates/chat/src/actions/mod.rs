//! Workspace mutations
//!
//! Provides the delete-old-files pass, the only operation that changes
//! anything on the Slack side.

mod cleanup;

pub use cleanup::{DeleteReport, FileCleanup, parse_age};
