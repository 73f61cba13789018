// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exchange of buffers with the accelerator.
//!
//! Client buffers are converted into [`BufferHeader`]s when submitted, and the headers returned
//! by the accelerator are converted back when their [`PortMessage`] is processed.

use log::debug;
use log::error;
use log::trace;
use log::warn;

use crate::accel::AccelError;
use crate::accel::AcceleratorComponent;
use crate::accel::AcceleratorService;
use crate::accel::BufferHeader;
use crate::accel::BufferTag;
use crate::accel::HeaderFlags;
use crate::accel::PortId;
use crate::accel::PortMessage;
use crate::accel::EVENT_ERROR;
use crate::accel::EVENT_FORMAT_CHANGED;
use crate::accel::TIME_UNKNOWN;
use crate::protocol::BufferFlags;
use crate::protocol::ClientEvent;
use crate::protocol::DecoderCmd;
use crate::protocol::EncoderCmd;
use crate::protocol::Field;
use crate::protocol::QueueDirection;
use crate::queue::BufferOutcome;
use crate::queue::BufferState;
use crate::queue::ClientBuffer;
use crate::role::RoleOps;
use crate::ClientEventQueue;
use crate::IoctlResult;

use super::CodecDevice;
use super::CodecSession;

/// Header describing `client` to the accelerator.
fn header_for(client: &ClientBuffer, field_override: Option<Field>) -> BufferHeader {
    // Every buffer is a complete frame.
    let mut flags = HeaderFlags::FRAME_END;
    if client.flags.contains(BufferFlags::KEYFRAME) {
        flags |= HeaderFlags::KEYFRAME;
    }
    if client.bytes_used == 0 || client.flags.contains(BufferFlags::LAST) {
        flags |= HeaderFlags::EOS;
    }
    match field_override.unwrap_or(client.field) {
        Field::InterlacedBt => flags |= HeaderFlags::INTERLACED,
        Field::InterlacedTb => flags |= HeaderFlags::INTERLACED | HeaderFlags::TOP_FIELD_FIRST,
        _ => (),
    }

    BufferHeader {
        tag: BufferTag::Slot(client.index),
        flags,
        length: client.bytes_used,
        alloc_size: client.length,
        pts: i64::try_from(client.timestamp_ns / 1000).unwrap_or(i64::MAX),
        dts: TIME_UNKNOWN,
        dma_handle: client.dma_handle,
    }
}

/// Field of a frame produced with header `flags`.
fn field_from_flags(flags: HeaderFlags) -> Field {
    let interlace = flags & (HeaderFlags::INTERLACED | HeaderFlags::TOP_FIELD_FIRST);
    if interlace == HeaderFlags::INTERLACED {
        Field::InterlacedBt
    } else if interlace == HeaderFlags::INTERLACED | HeaderFlags::TOP_FIELD_FIRST {
        Field::InterlacedTb
    } else {
        Field::None
    }
}

impl<A: AcceleratorService, E: ClientEventQueue> CodecSession<A, E> {
    /// Queue `buffer` on the `direction` queue. It is submitted to the accelerator the next time
    /// the session's job runs.
    pub fn qbuf(&mut self, direction: QueueDirection, mut buffer: ClientBuffer) -> IoctlResult<()> {
        let queue = self.queue_mut(direction);
        let slot = queue.buffers.buffer(buffer.index).ok_or(libc::EINVAL)?;
        let length = match buffer.dma_handle {
            Some(_) => buffer.length,
            None => slot.client.length,
        };
        if length < queue.state.size_image {
            warn!(
                "{:?} buffer {} is too small ({} < {} bytes)",
                direction, buffer.index, length, queue.state.size_image
            );
            return Err(libc::EINVAL);
        }
        buffer.length = length;

        match direction {
            QueueDirection::Output => {
                if buffer.field == Field::Any {
                    buffer.field = Field::None;
                }
            }
            QueueDirection::Capture => {
                buffer.bytes_used = queue.state.size_image;
                buffer.flags.remove(BufferFlags::LAST | BufferFlags::KEYFRAME | BufferFlags::ERROR);
            }
        }

        queue.buffers.queue(buffer)
    }

    /// Dequeue the next buffer returned on the `direction` queue.
    pub fn dqbuf(&mut self, direction: QueueDirection) -> IoctlResult<ClientBuffer> {
        self.queue_mut(direction).buffers.dequeue()
    }

    /// Submit the next queued buffer of `direction` to the accelerator, if there is one.
    pub(super) fn submit_next(&mut self, direction: QueueDirection) {
        let field_override = match direction {
            QueueDirection::Output => self.config.field_override,
            QueueDirection::Capture => None,
        };
        let buffers = &mut self.queue_mut(direction).buffers;
        let Some(index) = buffers.take_ready() else {
            return;
        };
        let Some(buffer) = buffers.buffer_mut(index) else {
            return;
        };
        buffer.header = header_for(&buffer.client, field_override);
        let header = buffer.header.clone();

        let port = PortId::from(direction);
        trace!(
            "session {}: submitting {:?} buffer {} ({} bytes, flags {:?})",
            self.id,
            direction,
            index,
            header.length,
            header.flags
        );
        let result = match self.component.as_mut() {
            Some(component) => component.submit_buffer(port, header),
            None => Err(AccelError::PortDisabled),
        };
        if let Err(e) = result {
            error!(
                "session {}: failed to submit {:?} buffer {}: {}",
                self.id, direction, index, e
            );
            self.queue_mut(direction)
                .buffers
                .buffer_done(index, BufferOutcome::Error);
        }
    }

    /// Process all the messages sent by the accelerator so far. Returns the number of messages
    /// processed.
    pub fn process_messages(&mut self) -> usize {
        let mut count = 0;
        while let Ok(message) = self.messages.try_recv() {
            self.handle_message(message);
            count += 1;
        }

        count
    }

    pub(super) fn handle_message(&mut self, message: PortMessage) {
        match message {
            PortMessage::BufferDone {
                port: PortId::Input,
                status,
                header,
            } => self.input_buffer_done(status, header),
            PortMessage::BufferDone {
                port: PortId::Output,
                status,
                header,
            } => self.output_buffer_done(status, header),
            PortMessage::BufferDone { port, .. } => {
                warn!("session {}: buffer returned on {:?} port", self.id, port)
            }
            PortMessage::Event {
                port: PortId::Output,
                cmd: EVENT_FORMAT_CHANGED,
                payload,
            } => self.format_changed(&payload),
            PortMessage::Event {
                port,
                cmd: EVENT_ERROR,
                ..
            } => error!("session {}: accelerator error on {:?} port", self.id, port),
            PortMessage::Event { port, cmd, .. } => warn!(
                "session {}: ignoring event {:#010x} on {:?} port",
                self.id, cmd, port
            ),
        }
    }

    /// Whether `index` of the `direction` queue is held by the accelerator.
    fn is_in_flight(&self, direction: QueueDirection, index: u32) -> bool {
        let in_flight = matches!(
            self.queue(direction).buffers.buffer(index),
            Some(buffer) if buffer.state() == BufferState::InFlight
        );
        if !in_flight {
            warn!(
                "session {}: ignoring return of {:?} buffer {} not held by the accelerator",
                self.id, direction, index
            );
        }

        in_flight
    }

    fn port_enabled(&self, port: PortId) -> bool {
        self.component
            .as_ref()
            .map(|c| c.port(port).enabled)
            .unwrap_or(false)
    }

    fn input_buffer_done(&mut self, status: Result<(), AccelError>, header: BufferHeader) {
        let index = match header.tag {
            BufferTag::Eos => {
                trace!("session {}: end of stream buffer returned", self.id);
                self.output.state.eos_in_use = false;
                return;
            }
            BufferTag::Slot(index) => index,
        };
        if !self.is_in_flight(QueueDirection::Output, index) {
            return;
        }

        let outcome = match status {
            Err(e) => {
                error!("session {}: input buffer {} failed: {}", self.id, index, e);
                BufferOutcome::Error
            }
            Ok(()) if self.port_enabled(PortId::Input) => BufferOutcome::Done,
            // The port is being disabled, the buffer has not been consumed.
            Ok(()) => BufferOutcome::Requeue,
        };

        let queue = &mut self.output;
        if let Some(buffer) = queue.buffers.buffer_mut(index) {
            buffer.header = header;
            if outcome == BufferOutcome::Done {
                buffer.client.sequence = queue.state.sequence;
                queue.state.sequence = queue.state.sequence.wrapping_add(1);
            }
        }
        queue.buffers.buffer_done(index, outcome);
        if outcome != BufferOutcome::Error {
            self.num_input_buffers += 1;
        }
    }

    fn output_buffer_done(&mut self, status: Result<(), AccelError>, header: BufferHeader) {
        let BufferTag::Slot(index) = header.tag else {
            warn!("session {}: end of stream buffer on output port", self.id);
            return;
        };
        if !self.is_in_flight(QueueDirection::Capture, index) {
            return;
        }

        if let Err(e) = status {
            error!("session {}: output buffer {} failed: {}", self.id, index, e);
            self.capture
                .buffers
                .buffer_done(index, BufferOutcome::Error);
            return;
        }

        // Empty buffers carry nothing for the client, give them back to the accelerator.
        if header.length == 0 && !header.flags.contains(HeaderFlags::EOS) {
            if !self.port_enabled(PortId::Output) {
                self.capture
                    .buffers
                    .buffer_done(index, BufferOutcome::Requeue);
                return;
            }

            let result = match self.component.as_mut() {
                Some(component) => component.submit_buffer(PortId::Output, header),
                None => Err(AccelError::PortDisabled),
            };
            if let Err(e) = result {
                error!(
                    "session {}: failed to resubmit output buffer {}: {}",
                    self.id, index, e
                );
                self.capture
                    .buffers
                    .buffer_done(index, BufferOutcome::Error);
            }
            return;
        }

        let eos = header.flags.contains(HeaderFlags::EOS);
        let outcome = if header.flags.contains(HeaderFlags::CORRUPTED) {
            BufferOutcome::Error
        } else {
            BufferOutcome::Done
        };

        let queue = &mut self.capture;
        if let Some(buffer) = queue.buffers.buffer_mut(index) {
            let client = &mut buffer.client;
            if eos {
                client.flags.insert(BufferFlags::LAST);
            }
            client.timestamp_ns = u64::try_from(header.pts)
                .map(|pts| pts.saturating_mul(1000))
                .unwrap_or(0);
            client.bytes_used = header.length;
            client.field = field_from_flags(header.flags);
            client
                .flags
                .set(BufferFlags::KEYFRAME, header.flags.contains(HeaderFlags::KEYFRAME));
            client.flags.insert(BufferFlags::TIMESTAMP_COPY);
            client.sequence = queue.state.sequence;
            queue.state.sequence = queue.state.sequence.wrapping_add(1);
            buffer.header = header;
        }
        queue.buffers.buffer_done(index, outcome);
        self.num_output_buffers += 1;

        if eos {
            debug!("session {}: end of stream reached", self.id);
            self.send_event(ClientEvent::EndOfStream);
        }
    }

    /// Submit the reserved end-of-stream buffer to the input port.
    pub(super) fn submit_eos(&mut self) {
        let state = &mut self.output.state;
        if state.eos_in_use {
            warn!("session {}: end of stream already pending", self.id);
            return;
        }
        let Some(mut header) = state.eos_buffer.clone() else {
            warn!(
                "session {}: cannot signal end of stream while OUTPUT is not streaming",
                self.id
            );
            return;
        };
        header.flags = HeaderFlags::EOS;
        header.length = 0;
        header.pts = 0;
        header.dts = 0;
        state.eos_in_use = true;

        let result = match self.component.as_mut() {
            Some(component) => component.submit_buffer(PortId::Input, header),
            None => Err(AccelError::PortDisabled),
        };
        if let Err(e) = result {
            error!(
                "session {}: failed to submit end of stream buffer: {}",
                self.id, e
            );
            self.output.state.eos_in_use = false;
        }
    }
}

impl<A: AcceleratorService> CodecDevice<A> {
    pub fn try_decoder_cmd(&self, cmd: DecoderCmd) -> IoctlResult<DecoderCmd> {
        if !self.role.supports(RoleOps::DECODER_CMD) {
            return Err(libc::ENOTTY);
        }

        match cmd {
            DecoderCmd::Start | DecoderCmd::Stop { to_black: false } => Ok(cmd),
            DecoderCmd::Stop { to_black: true } => {
                error!("stopping to black is not supported");
                Err(libc::EINVAL)
            }
            DecoderCmd::Pause | DecoderCmd::Resume => Err(libc::EINVAL),
        }
    }

    pub fn decoder_cmd<E: ClientEventQueue>(
        &self,
        session: &mut CodecSession<A, E>,
        cmd: DecoderCmd,
    ) -> IoctlResult<DecoderCmd> {
        let cmd = self.try_decoder_cmd(cmd)?;
        match cmd {
            DecoderCmd::Start => session.capture.buffers.set_last_buffer_dequeued(false),
            DecoderCmd::Stop { .. } => session.submit_eos(),
            DecoderCmd::Pause | DecoderCmd::Resume => (),
        }

        Ok(cmd)
    }

    pub fn try_encoder_cmd(&self, cmd: EncoderCmd) -> IoctlResult<EncoderCmd> {
        if !self.role.supports(RoleOps::ENCODER_CMD) {
            return Err(libc::ENOTTY);
        }

        match cmd {
            EncoderCmd::Start | EncoderCmd::Stop => Ok(cmd),
            EncoderCmd::Pause | EncoderCmd::Resume => Err(libc::EINVAL),
        }
    }

    pub fn encoder_cmd<E: ClientEventQueue>(
        &self,
        session: &mut CodecSession<A, E>,
        cmd: EncoderCmd,
    ) -> IoctlResult<EncoderCmd> {
        let cmd = self.try_encoder_cmd(cmd)?;
        match cmd {
            EncoderCmd::Start => session.capture.buffers.set_last_buffer_dequeued(false),
            EncoderCmd::Stop => session.submit_eos(),
            EncoderCmd::Pause | EncoderCmd::Resume => (),
        }

        Ok(cmd)
    }
}
