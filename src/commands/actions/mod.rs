//! Command actions.
//!
//! Actions only talk to the homeserver through the session or its
//! [`ProtocolClient`](crate::matrix::ProtocolClient), so they run the same
//! against the matrix-sdk client and against a mock.

mod join;
mod leave;
mod msg;
mod rooms;
mod service;

pub use crate::commands::actions::{
    join::join, leave::leave, msg::msg, rooms::rooms, service::service,
};
