// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface between the sessions and the external scheduler running their jobs.

use log::debug;

use crate::accel::AcceleratorService;
use crate::protocol::QueueDirection;
use crate::ClientEventQueue;

use super::CodecSession;

/// A unit of work that an external mem2mem scheduler can run.
///
/// Sessions accept whatever the client queued: a job is ready as soon as a buffer is waiting on
/// either queue, and running it submits at most one buffer per direction before returning.
pub trait M2mJob {
    fn job_ready(&self) -> bool;
    fn device_run(&mut self);
    /// Stop submitting buffers until the next stream stop. Buffers already submitted are returned
    /// normally.
    fn job_abort(&mut self);
}

impl<A: AcceleratorService, E: ClientEventQueue> M2mJob for CodecSession<A, E> {
    fn job_ready(&self) -> bool {
        [QueueDirection::Output, QueueDirection::Capture]
            .into_iter()
            .any(|direction| {
                let buffers = &self.queue(direction).buffers;
                buffers.is_streaming() && buffers.has_ready()
            })
    }

    fn device_run(&mut self) {
        if self.aborting {
            debug!("session {}: aborting, not submitting buffers", self.id);
            return;
        }

        for direction in [QueueDirection::Output, QueueDirection::Capture] {
            if self.queue(direction).buffers.is_streaming() {
                self.submit_next(direction);
            }
        }
    }

    fn job_abort(&mut self) {
        self.aborting = true;
    }
}

#[cfg(test)]
mod tests {
    use crate::accel::HeaderFlags;
    use crate::accel::PortId;
    use crate::protocol::QueueDirection;
    use crate::queue::BufferState;
    use crate::role::Role;

    use super::super::fake::device_for_role;
    use super::super::fake::queue_buffer;
    use super::super::fake::start_streaming;
    use super::M2mJob;

    #[test]
    fn job_runs_one_buffer_per_direction() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        start_streaming(&device, &mut session, 3);
        assert!(!session.job_ready());

        queue_buffer(&mut session, QueueDirection::Output, 0, 100);
        queue_buffer(&mut session, QueueDirection::Output, 1, 100);
        assert!(session.job_ready());

        session.device_run();
        assert_eq!(session.fake().held_on(PortId::Input), 1);
        assert_eq!(session.fake().held_on(PortId::Output), 0);
        assert!(session.job_ready());

        queue_buffer(&mut session, QueueDirection::Capture, 0, 0);
        session.device_run();
        assert_eq!(session.fake().held_on(PortId::Input), 2);
        assert_eq!(session.fake().held_on(PortId::Output), 1);
        assert!(!session.job_ready());

        session
            .fake()
            .complete(PortId::Output, 1000, HeaderFlags::KEYFRAME);
        session.process_messages();
        let buffer = session.dqbuf(QueueDirection::Capture).unwrap();
        assert_eq!(buffer.bytes_used, 1000);
    }

    #[test]
    fn queued_buffers_wait_for_streaming() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        device.reqbufs(&mut session, QueueDirection::Output, 2).unwrap();
        queue_buffer(&mut session, QueueDirection::Output, 0, 100);
        assert!(!session.job_ready());

        device.streamon(&mut session, QueueDirection::Output).unwrap();
        assert!(session.job_ready());
    }

    #[test]
    fn abort_stops_submissions_until_streamoff() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        start_streaming(&device, &mut session, 2);
        queue_buffer(&mut session, QueueDirection::Output, 0, 100);
        session.device_run();
        queue_buffer(&mut session, QueueDirection::Output, 1, 100);

        session.job_abort();
        session.device_run();
        assert_eq!(session.fake().held_on(PortId::Input), 1);
        assert_eq!(
            session
                .queue(QueueDirection::Output)
                .buffers
                .buffer(1)
                .unwrap()
                .state(),
            BufferState::Queued
        );

        // Already submitted buffers come back normally.
        session
            .fake()
            .complete(PortId::Input, 100, HeaderFlags::empty());
        session.process_messages();
        assert_eq!(session.dqbuf(QueueDirection::Output).unwrap().index, 0);

        device.streamoff(&mut session, QueueDirection::Output).unwrap();
        device.streamon(&mut session, QueueDirection::Output).unwrap();
        queue_buffer(&mut session, QueueDirection::Output, 1, 100);
        session.device_run();
        assert_eq!(session.fake().held_on(PortId::Input), 1);
    }
}
