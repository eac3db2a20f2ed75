//! # archlink-error
//!
//! Unified error handling for archlink, following OpenDAL's error handling practices.
//!
//! ## Design Philosophy
//!
//! - **ErrorKind**: Know what error occurred (e.g., ConnectionFailed, ResponseTimeout)
//! - **ErrorStatus**: Decide how to handle it (Permanent, Temporary, Persistent)
//! - **Error Context**: Assist in locating the cause with rich context
//! - **Error Source**: Wrap underlying errors without leaking raw types
//!
//! ## Usage
//!
//! ```rust
//! use archlink_error::{Error, ErrorKind};
//!
//! fn example() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::ValidationFailed, "missing required field(s): state_type")
//!         .with_operation("validator::validate")
//!         .with_context("category", "environment")
//!         .with_context("missing", "state_type"))
//! }
//! ```
//!
//! ## Principles
//!
//! - All functions return `Result<T, archlink_error::Error>`
//! - External errors are wrapped with `set_source(err)`
//! - Same error handled once, subsequent ops only append context
//! - Don't abuse `From<OtherError>` to prevent raw error leakage

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::{ErrorClass, ErrorKind};
pub use status::ErrorStatus;

/// Result type alias using archlink Error
pub type Result<T> = std::result::Result<T, Error>;
