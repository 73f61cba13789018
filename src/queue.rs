// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client-side buffer queues.
//!
//! Each session has two [`BufferQueue`]s, one per direction. They keep the client buffers,
//! paired with the header used to exchange them with the accelerator, and track who currently owns
//! each buffer.

use std::collections::VecDeque;

use crate::accel::BufferHeader;
use crate::accel::BufferTag;
use crate::protocol::BufferFlags;
use crate::protocol::Field;
use crate::protocol::QueueDirection;
use crate::IoctlResult;

/// Maximum number of buffers of a queue.
pub const MAX_BUFFERS: u32 = 32;

/// Client-side metadata of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientBuffer {
    pub index: u32,
    pub flags: BufferFlags,
    pub field: Field,
    /// Number of valid bytes in the buffer.
    pub bytes_used: u32,
    /// Size of the buffer's memory.
    pub length: u32,
    pub timestamp_ns: u64,
    pub sequence: u32,
    /// Handle to the shared memory backing the buffer, if imported by the client.
    pub dma_handle: Option<u64>,
}

/// Current owner of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the client.
    Dequeued,
    /// Queued by the client, waiting to be submitted to the accelerator.
    Queued,
    /// Held by the accelerator.
    InFlight,
    /// Returned by the accelerator, waiting to be dequeued by the client.
    Done,
}

/// How a buffer is given back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    /// The buffer has been processed.
    Done,
    /// The buffer has been processed but its content is not valid.
    Error,
    /// The buffer has not been processed and can be queued again.
    Requeue,
}

/// A client buffer paired with its accelerator header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBuffer {
    pub client: ClientBuffer,
    pub header: BufferHeader,
    state: BufferState,
}

impl ExchangeBuffer {
    fn new(index: u32, size: u32) -> Self {
        Self {
            client: ClientBuffer {
                index,
                length: size,
                field: Field::None,
                ..Default::default()
            },
            header: BufferHeader::new(BufferTag::Slot(index), size),
            state: BufferState::Dequeued,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }
}

#[derive(Debug)]
pub struct BufferQueue {
    direction: QueueDirection,
    buffers: Vec<ExchangeBuffer>,
    /// Indices of the buffers queued by the client but not submitted yet.
    ready: VecDeque<u32>,
    /// Indices of the buffers returned by the accelerator but not dequeued yet.
    done: VecDeque<u32>,
    streaming: bool,
    /// Set once the last buffer of a stream has been dequeued. Further dequeues fail with `EPIPE`
    /// until the queue is restarted.
    last_buffer_dequeued: bool,
}

impl BufferQueue {
    pub fn new(direction: QueueDirection) -> Self {
        Self {
            direction,
            buffers: Default::default(),
            ready: Default::default(),
            done: Default::default(),
            streaming: false,
            last_buffer_dequeued: false,
        }
    }

    pub fn direction(&self) -> QueueDirection {
        self.direction
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Whether buffers are allocated, preventing format changes.
    pub fn is_busy(&self) -> bool {
        !self.buffers.is_empty()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
        if streaming {
            self.last_buffer_dequeued = false;
        }
    }

    pub fn last_buffer_dequeued(&self) -> bool {
        self.last_buffer_dequeued
    }

    pub fn set_last_buffer_dequeued(&mut self, last: bool) {
        self.last_buffer_dequeued = last;
    }

    pub fn buffer(&self, index: u32) -> Option<&ExchangeBuffer> {
        self.buffers.get(index as usize)
    }

    pub fn buffer_mut(&mut self, index: u32) -> Option<&mut ExchangeBuffer> {
        self.buffers.get_mut(index as usize)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &ExchangeBuffer> {
        self.buffers.iter()
    }

    /// Number of buffers currently in `state`.
    pub fn count_in_state(&self, state: BufferState) -> usize {
        self.buffers.iter().filter(|b| b.state == state).count()
    }

    /// Number of buffers that can still be added to the queue.
    pub fn free_slots(&self) -> u32 {
        MAX_BUFFERS.saturating_sub(self.buffers.len() as u32)
    }

    /// Replace the current buffers with `count` new buffers of `size` bytes, at most
    /// [`MAX_BUFFERS`].
    pub fn allocate(&mut self, count: u32, size: u32) {
        self.free();
        let count = count.min(MAX_BUFFERS);
        self.buffers = (0..count).map(|i| ExchangeBuffer::new(i, size)).collect();
    }

    /// Append up to `count` new buffers of `size` bytes without exceeding [`MAX_BUFFERS`],
    /// returning the index of the first one.
    pub fn add(&mut self, count: u32, size: u32) -> u32 {
        let first = self.buffers.len() as u32;
        let last = first.saturating_add(count.min(self.free_slots()));
        self.buffers
            .extend((first..last).map(|i| ExchangeBuffer::new(i, size)));
        first
    }

    pub fn free(&mut self) {
        self.buffers.clear();
        self.ready.clear();
        self.done.clear();
    }

    /// Hand `buffer` over to the queue. The buffer must currently be owned by the client.
    pub fn queue(&mut self, buffer: ClientBuffer) -> IoctlResult<()> {
        let index = buffer.index;
        let slot = self.buffers.get_mut(index as usize).ok_or(libc::EINVAL)?;
        if slot.state != BufferState::Dequeued {
            log::warn!(
                "{:?} buffer {} queued while in state {:?}",
                self.direction,
                index,
                slot.state
            );
            return Err(libc::EINVAL);
        }

        slot.client = buffer;
        slot.state = BufferState::Queued;
        self.ready.push_back(index);

        Ok(())
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Remove the next queued buffer and mark it as held by the accelerator.
    pub fn take_ready(&mut self) -> Option<u32> {
        let index = self.ready.pop_front()?;
        if let Some(buffer) = self.buffers.get_mut(index as usize) {
            buffer.state = BufferState::InFlight;
        }
        Some(index)
    }

    /// Give buffer `index`, currently held by the accelerator, back to the client.
    ///
    /// Returns `false` if the buffer was not in flight, in which case nothing is changed.
    pub fn buffer_done(&mut self, index: u32, outcome: BufferOutcome) -> bool {
        let streaming = self.streaming;
        let Some(buffer) = self.buffers.get_mut(index as usize) else {
            log::error!("{:?} buffer {} does not exist", self.direction, index);
            return false;
        };
        if buffer.state != BufferState::InFlight {
            log::warn!(
                "{:?} buffer {} returned while in state {:?}",
                self.direction,
                index,
                buffer.state
            );
            return false;
        }

        match outcome {
            BufferOutcome::Done => {
                buffer.client.flags.remove(BufferFlags::ERROR);
                buffer.state = BufferState::Done;
                self.done.push_back(index);
            }
            BufferOutcome::Error => {
                buffer.client.flags.insert(BufferFlags::ERROR);
                buffer.state = BufferState::Done;
                self.done.push_back(index);
            }
            // An unprocessed buffer goes back to the ready list if it can still be submitted.
            BufferOutcome::Requeue if streaming => {
                buffer.state = BufferState::Queued;
                self.ready.push_front(index);
            }
            BufferOutcome::Requeue => buffer.state = BufferState::Dequeued,
        }

        true
    }

    /// Give all the buffers queued but not submitted back to the client, in a state allowing them
    /// to be queued again. Returns the number of buffers given back.
    pub fn return_queued(&mut self) -> usize {
        let count = self.ready.len();
        for index in self.ready.drain(..) {
            if let Some(buffer) = self.buffers.get_mut(index as usize) {
                buffer.state = BufferState::Dequeued;
            }
        }

        count
    }

    /// Forget the processed buffers that have not been dequeued, giving them back to the client.
    pub fn return_done(&mut self) {
        for index in self.done.drain(..) {
            if let Some(buffer) = self.buffers.get_mut(index as usize) {
                buffer.state = BufferState::Dequeued;
            }
        }
    }

    /// Dequeue the next processed buffer.
    ///
    /// Fails with `EPIPE` after the last buffer of the stream has been dequeued, and `EAGAIN` if no
    /// buffer is available yet.
    pub fn dequeue(&mut self) -> IoctlResult<ClientBuffer> {
        let Some(index) = self.done.pop_front() else {
            return Err(if self.last_buffer_dequeued {
                libc::EPIPE
            } else {
                libc::EAGAIN
            });
        };
        let buffer = self.buffers.get_mut(index as usize).ok_or(libc::EINVAL)?;
        buffer.state = BufferState::Dequeued;

        if self.direction == QueueDirection::Capture
            && buffer.client.flags.contains(BufferFlags::LAST)
        {
            self.last_buffer_dequeued = true;
        }

        Ok(buffer.client.clone())
    }
}
