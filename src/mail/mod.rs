//! Delivery of room messages as mail files.
//!
//! [`message`] turns a [`crate::matrix::events::MessageEvent`] into a MIME
//! message, [`Maildir`] stores it in a local maildir where any mail reader can
//! pick it up.

mod maildir;
pub mod message;

pub use crate::mail::maildir::Maildir;
