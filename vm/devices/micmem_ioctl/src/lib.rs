// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The control device for host/accelerator DMA.
//!
//! User space opens the control file, pins its buffers, maps them for a
//! board, and then issues transfers through ioctls. A [`Session`] holds the
//! per-open state and a [`ControlPlane`] the state shared by every open.

#![forbid(unsafe_code)]

pub mod protocol;
mod session;


pub use session::BoardSource;
pub use session::ControlPlane;
pub use session::Session;
pub use session::SessionConfig;
pub use session::SessionError;
