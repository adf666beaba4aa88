//! Echo protocol.
//!
//! One request/response per connection:
//!
//! ```text
//! Request:  up to 32 bytes, no framing
//! Response: the same bytes
//! ```
//!
//! Both sides close after the response.

pub mod handler;

pub use handler::{echo_once, handle_connection, MAX_FRAME};
