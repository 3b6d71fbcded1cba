// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Crate root for the FCP client protocol node.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Client-facing FCP protocol core.
//!
//! Decoded messages from [`fcp_wire`] are dispatched per connection by
//! [`dispatch::handle`]. Requests live either on their connection or in the
//! [`registry::ClientRegistry`]; forever requests are mutated only on the
//! persistent job thread and checkpointed by [`persist::FileRequestStore`].
//! USK watches flow from a [`usk::UskUpdateService`] to each connection over
//! an event channel.

use std::sync::{Mutex, MutexGuard};

mod binary;

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod identifier;
pub mod jobs;
pub mod message;
pub mod node;
pub mod persist;
pub mod registry;
pub mod request;
pub mod server;
pub mod usk;

pub use fcp_wire as wire;

pub use connection::Connection;
pub use dispatch::{handle, Flow};
pub use error::{FcpError, ProtocolErrorCode};
pub use identifier::{RequestIdentifier, RequestKind};
pub use node::{Node, NodeInfo};
pub use registry::{ClientRegistry, PersistentClient};

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
