// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate bridges memory-to-memory transform clients to a remote video accelerator.
//!
//! Clients see a classic two-queue interface: source buffers are queued on the `OUTPUT` queue,
//! and the transformed result is received on the `CAPTURE` queue. Behind this interface, every
//! transform (decoding, encoding, ISP scaling and conversion, deinterlacing, still image encoding)
//! is performed by a component of an accelerator that can only be reached through asynchronous
//! messages.
//!
//! # Traits to implement by the host
//!
//! * The accelerator transport must implement [`accel::AcceleratorService`], and the components it
//!   creates [`accel::AcceleratorComponent`]. Buffers returned by the accelerator, as well as
//!   the events it emits, are sent as [`accel::PortMessage`]s over the channel given when enabling
//!   a port.
//! * Client notifications (end of stream, resolution change) are sent through an implementation
//!   of [`ClientEventQueue`].
//!
//! # Anatomy of a device
//!
//! A [`codec::CodecDevice`] is created for one [`role::Role`] and a [`config::DeviceConfig`]. At
//! creation time it queries the accelerator for the encodings supported by the role's component
//! and builds the [`format::FormatCatalog`] of the device. Clients then open
//! [`codec::CodecSession`]s on it, negotiate formats, allocate and queue buffers, and start
//! streaming. Configuration requests on sessions of the same device are serialized by the device.
//!
//! Buffers are moved to the accelerator when the external scheduler runs the session's job (see
//! [`codec::job::M2mJob`]), and come back when the session processes the messages sent by the
//! accelerator with [`codec::CodecSession::process_messages`].

pub mod accel;
pub mod codec;
pub mod config;
pub mod format;
pub mod geometry;
pub mod protocol;
pub mod queue;
pub mod role;

use protocol::ClientEvent;

/// Result of a client request. Errors are `libc` error codes.
pub type IoctlResult<T> = Result<T, i32>;

/// Trait for sending events to the client of a session.
pub trait ClientEventQueue {
    /// Send `event` to the client.
    fn send_event(&mut self, event: ClientEvent);
}

/// For sessions whose client is not interested in events.
impl ClientEventQueue for () {
    fn send_event(&mut self, _event: ClientEvent) {}
}

/// Events can be collected into a vector, which is mostly useful for tests.
impl ClientEventQueue for Vec<ClientEvent> {
    fn send_event(&mut self, event: ClientEvent) {
        self.push(event);
    }
}
