// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer allocation, streaming state, and creation of the accelerator component.

use std::sync::mpsc::RecvTimeoutError;
use std::time::Instant;

use log::debug;
use log::error;
use log::warn;
use zerocopy::AsBytes;

use crate::accel::params::ImageEffect;
use crate::accel::params::ImageFxParameters;
use crate::accel::AcceleratorComponent;
use crate::accel::AcceleratorService;
use crate::accel::BufferHeader;
use crate::accel::BufferTag;
use crate::accel::ParameterId;
use crate::accel::PortId;
use crate::protocol::QueueDirection;
use crate::queue::MAX_BUFFERS;
use crate::role::Role;
use crate::ClientEventQueue;
use crate::IoctlResult;

use super::CodecDevice;
use super::CodecSession;

/// Widest input the advanced deinterlacer can process in real time.
const ADVANCED_DEINTERLACE_MAX_WIDTH: u32 = 800;

impl<A: AcceleratorService, E: ClientEventQueue> CodecSession<A, E> {
    pub(super) fn set_param_or_log<T: AsBytes>(&mut self, port: PortId, id: ParameterId, value: &T) {
        let Some(component) = self.component.as_mut() else {
            return;
        };
        if let Err(e) = component.set_param(port, id, value) {
            error!(
                "session {}: failed to set {:?} on {:?} port: {}",
                self.id, id, port, e
            );
        }
    }

    /// Wait until the accelerator has returned all the buffers of `port`, or until the drain
    /// timeout expires. Messages received meanwhile are processed.
    pub(super) fn drain(&mut self, port: PortId) {
        let deadline = Instant::now() + self.config.drain_timeout;

        loop {
            let in_flight = self
                .component
                .as_ref()
                .map(|c| c.port(port).buffers_in_flight())
                .unwrap_or(0);
            if in_flight == 0 {
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.messages.recv_timeout(remaining) {
                Ok(message) => self.handle_message(message),
                Err(RecvTimeoutError::Timeout) => {
                    error!(
                        "session {}: timed out waiting for {} buffers of the {:?} port",
                        self.id, in_flight, port
                    );
                    break;
                }
                // The session owns a sender, this cannot happen.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.process_messages();
    }
}

impl<A: AcceleratorService> CodecDevice<A> {
    /// Create the component of `session` and apply its initial configuration.
    fn create_component<E: ClientEventQueue>(
        &self,
        service: &mut A,
        session: &mut CodecSession<A, E>,
    ) -> IoctlResult<()> {
        let name = self.role.config().component;
        let component = service.create_component(name).map_err(|e| {
            error!("session {}: failed to create {}: {}", session.id, name, e);
            libc::ENOMEM
        })?;
        session.component = Some(component);

        session.set_param_or_log(PortId::Input, ParameterId::ZeroCopy, &1u32);
        session.set_param_or_log(PortId::Output, ParameterId::ZeroCopy, &1u32);

        match self.role {
            Role::Decode => {
                session.set_param_or_log(
                    PortId::Output,
                    ParameterId::VideoValidateTimestamps,
                    &0u32,
                );
                session.set_param_or_log(
                    PortId::Control,
                    ParameterId::VideoStopOnParColourChange,
                    &1u32,
                );
            }
            Role::Deinterlace => {
                let effect = if self.config.advanced_deinterlace
                    && session.output.state.crop_width <= ADVANCED_DEINTERLACE_MAX_WIDTH
                {
                    ImageEffect::DeinterlaceAdvanced
                } else {
                    ImageEffect::DeinterlaceFast
                };
                // Frame interval 5, no frame rate halving.
                let params = ImageFxParameters::new(effect, &[5, u32::MAX, 0, 0]);
                session.set_param_or_log(PortId::Output, ParameterId::ImageEffectParameters, &params);
            }
            Role::EncodeImage => {
                session.set_param_or_log(PortId::Control, ParameterId::ExifDisable, &0u32);
                session.set_param_or_log(PortId::Output, ParameterId::JpegIjgScaling, &1u32);
            }
            Role::Encode | Role::Isp => (),
        }

        for direction in [QueueDirection::Output, QueueDirection::Capture] {
            if let Err(e) = session.push_port_format(direction) {
                error!(
                    "session {}: failed to set initial {:?} port format: {}",
                    session.id, direction, e
                );
                if let Some(component) = session.component.take() {
                    service.destroy_component(component);
                }
                return Err(libc::EINVAL);
            }
        }

        if self.role == Role::Encode {
            session.set_param_or_log(PortId::Output, ParameterId::VideoEncodeSpsTiming, &1u32);
            session.set_param_or_log(
                PortId::Control,
                ParameterId::VideoEncodeHeadersWithFrame,
                &1u32,
            );
            session.set_param_or_log(PortId::Control, ParameterId::MinimiseFragmentation, &1u32);
            session.set_param_or_log(PortId::Output, ParameterId::VideoEncodeSeiEnable, &1u32);
        }

        session.apply_controls();

        debug!("session {}: created component {}", session.id, name);
        Ok(())
    }

    /// Allocate `count` buffers on the `direction` queue, or free them if `count` is 0. Returns
    /// the number of buffers actually allocated, which is never more than [`MAX_BUFFERS`].
    pub fn reqbufs<E: ClientEventQueue>(
        &self,
        session: &mut CodecSession<A, E>,
        direction: QueueDirection,
        count: u32,
    ) -> IoctlResult<u32> {
        let mut service = self.lock();
        if session.queue(direction).buffers.is_streaming() {
            return Err(libc::EBUSY);
        }

        if count == 0 {
            session.queue_mut(direction).buffers.free();
            return Ok(0);
        }

        if session.component.is_none() {
            self.create_component(&mut service, session)?;
        }

        let size = session.queue(direction).state.size_image;
        let port = session
            .component
            .as_mut()
            .ok_or(libc::EINVAL)?
            .port_mut(PortId::from(direction));
        let count = count.max(port.minimum_buffer.num).min(MAX_BUFFERS);
        port.current_buffer.size = size;
        // One more for the end of stream buffer.
        port.current_buffer.num = count.saturating_add(1);

        session.queue_mut(direction).buffers.allocate(count, size);
        debug!(
            "session {}: allocated {} {:?} buffers of {} bytes",
            session.id, count, direction, size
        );

        Ok(count)
    }

    /// Add `count` buffers of `size` bytes to the `direction` queue. Returns the index of the
    /// first new buffer. Fewer buffers are added if the queue would otherwise hold more than
    /// [`MAX_BUFFERS`], and none with `ENOBUFS` if it is already full.
    ///
    /// If the queue is streaming, its port is disabled and re-enabled with the new buffer count.
    pub fn create_bufs<E: ClientEventQueue>(
        &self,
        session: &mut CodecSession<A, E>,
        direction: QueueDirection,
        count: u32,
        size: u32,
    ) -> IoctlResult<u32> {
        let mut service = self.lock();
        if size < session.queue(direction).state.size_image {
            return Err(libc::EINVAL);
        }
        if count == 0 {
            return Ok(session.queue(direction).buffers.num_buffers() as u32);
        }
        if session.queue(direction).buffers.free_slots() == 0 {
            warn!(
                "session {}: {:?} queue already has {} buffers",
                session.id, direction, MAX_BUFFERS
            );
            return Err(libc::ENOBUFS);
        }

        if session.component.is_none() {
            self.create_component(&mut service, session)?;
        }

        let first = session.queue_mut(direction).buffers.add(count, size);
        let total = session.queue(direction).buffers.num_buffers() as u32;
        let streaming = session.queue(direction).buffers.is_streaming();
        let port_id = PortId::from(direction);

        let component = session.component.as_mut().ok_or(libc::EINVAL)?;
        let port = component.port(port_id);
        let num = total.max(port.minimum_buffer.num).saturating_add(1);
        if num <= port.current_buffer.num || !(streaming && port.enabled) {
            // Stopped ports get their buffer count when streaming starts.
            return Ok(first);
        }

        debug!(
            "session {}: growing {:?} port to {} buffers",
            session.id, port_id, num
        );
        if let Err(e) = component.disable_port(port_id) {
            error!(
                "session {}: failed to disable {:?} port: {}",
                session.id, port_id, e
            );
        }
        drop(service);
        session.drain(port_id);
        let _service = self.lock();

        if let Some(component) = session.component.as_mut() {
            component.port_mut(port_id).current_buffer.num = num;
        }
        session.push_port_format(direction).map_err(|e| {
            error!(
                "session {}: failed to set {:?} port format: {}",
                session.id, port_id, e
            );
            libc::EINVAL
        })?;
        let sender = session.message_sender.clone();
        if let Some(component) = session.component.as_mut() {
            component.enable_port(port_id, sender).map_err(|e| {
                error!(
                    "session {}: failed to re-enable {:?} port: {}",
                    session.id, port_id, e
                );
                e.errno()
            })?;
        }

        Ok(first)
    }

    pub fn streamon<E: ClientEventQueue>(
        &self,
        session: &mut CodecSession<A, E>,
        direction: QueueDirection,
    ) -> IoctlResult<()> {
        let buffers = &session.queue(direction).buffers;
        if buffers.num_buffers() == 0 {
            return Err(libc::EINVAL);
        }
        if buffers.is_streaming() {
            return Ok(());
        }

        let mut service = self.lock();
        session.queue_mut(direction).state.sequence = 0;
        if session.component.is_none() {
            self.create_component(&mut service, session)?;
        }

        let port_id = PortId::from(direction);
        let component = session.component.as_mut().ok_or(libc::EINVAL)?;
        if !component.is_enabled() {
            if let Err(e) = component.enable() {
                error!("session {}: failed to enable component: {}", session.id, e);
            }
        }

        let was_enabled = component.port(port_id).enabled;
        if was_enabled {
            let in_flight = component.port(port_id).buffers_in_flight();
            // The decoder keeps its output port enabled to report format changes.
            if !(self.role == Role::Decode && direction == QueueDirection::Capture && in_flight == 0)
            {
                warn!(
                    "session {}: {:?} port already enabled with {} buffers in flight",
                    session.id, port_id, in_flight
                );
            }

            // Disabling the port resets its buffer count.
            let num = component.port(port_id).current_buffer.num;
            if let Err(e) = component.disable_port(port_id) {
                error!(
                    "session {}: failed to disable {:?} port: {}",
                    session.id, port_id, e
                );
            }
            drop(service);
            session.drain(port_id);
            service = self.lock();
            if let Some(component) = session.component.as_mut() {
                component.port_mut(port_id).current_buffer.num = num;
            }
        }

        let num_buffers = session.queue(direction).buffers.num_buffers() as u32;
        let component = session.component.as_mut().ok_or(libc::EINVAL)?;
        let port = component.port_mut(port_id);
        let count = num_buffers.max(port.minimum_buffer.num);
        let mut push_format = was_enabled;
        let num = count.saturating_add(1);
        if port.current_buffer.num < num {
            port.current_buffer.num = num;
            push_format = true;
        }
        if push_format {
            session.push_port_format(direction).map_err(|e| {
                error!(
                    "session {}: failed to set {:?} port format: {}",
                    session.id, port_id, e
                );
                libc::EINVAL
            })?;
        }

        let sender = session.message_sender.clone();
        if self.role == Role::Decode && direction == QueueDirection::Output {
            // Format changes are reported on the output port, which must be enabled before the
            // client configures the CAPTURE queue.
            let component = session.component.as_mut().ok_or(libc::EINVAL)?;
            if !component.port(PortId::Output).enabled {
                component
                    .enable_port(PortId::Output, sender.clone())
                    .map_err(|e| {
                        error!(
                            "session {}: failed to enable output port: {}",
                            session.id, e
                        );
                        e.errno()
                    })?;
            }
        }

        if direction == QueueDirection::Output {
            let state = &mut session.output.state;
            state.eos_buffer = Some(BufferHeader::new(BufferTag::Eos, 0));
            state.eos_in_use = false;
        }

        let component = session.component.as_mut().ok_or(libc::EINVAL)?;
        if !component.port(port_id).enabled {
            component.enable_port(port_id, sender).map_err(|e| {
                error!(
                    "session {}: failed to enable {:?} port: {}",
                    session.id, port_id, e
                );
                e.errno()
            })?;
        }

        session.queue_mut(direction).buffers.set_streaming(true);
        debug!("session {}: {:?} streaming", session.id, direction);
        drop(service);

        Ok(())
    }

    pub fn streamoff<E: ClientEventQueue>(
        &self,
        session: &mut CodecSession<A, E>,
        direction: QueueDirection,
    ) -> IoctlResult<()> {
        let service = self.lock();
        let buffers = &mut session.queue_mut(direction).buffers;
        if !buffers.is_streaming() {
            buffers.return_queued();
            buffers.return_done();
            return Ok(());
        }

        buffers.set_streaming(false);
        let returned = buffers.return_queued();
        buffers.return_done();
        debug!(
            "session {}: stopping {:?}, {} queued buffers returned",
            session.id, direction, returned
        );

        let port_id = PortId::from(direction);
        if let Some(component) = session.component.as_mut() {
            if component.port(port_id).enabled {
                if let Err(e) = component.disable_port(port_id) {
                    error!(
                        "session {}: failed to disable {:?} port: {}",
                        session.id, port_id, e
                    );
                }
            }
        }

        drop(service);
        session.drain(port_id);
        let _service = self.lock();

        // Buffers processed before the port was disabled.
        session.queue_mut(direction).buffers.return_done();

        let sender = session.message_sender.clone();
        if let Some(component) = session.component.as_mut() {
            if self.role == Role::Decode
                && direction == QueueDirection::Capture
                && component.port(PortId::Input).enabled
            {
                // Keep receiving format changes while the stream goes on.
                if let Err(e) = component.enable_port(PortId::Output, sender) {
                    error!(
                        "session {}: failed to re-enable output port: {}",
                        session.id, e
                    );
                }
            }

            if !component.port(PortId::Input).enabled
                && !component.port(PortId::Output).enabled
                && component.is_enabled()
            {
                if let Err(e) = component.disable() {
                    error!("session {}: failed to disable component: {}", session.id, e);
                }
            }
        }

        if direction == QueueDirection::Output {
            let state = &mut session.output.state;
            state.eos_buffer = None;
            state.eos_in_use = false;
        }
        session.aborting = false;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use zerocopy::FromBytes;

    use crate::accel::params::ImageEffect;
    use crate::accel::params::ImageFxParameters;
    use crate::accel::AcceleratorComponent;
    use crate::accel::HeaderFlags;
    use crate::accel::ParameterId;
    use crate::accel::PortId;
    use crate::config::DeviceConfig;
    use crate::protocol::Format;
    use crate::protocol::PixelFormat;
    use crate::protocol::QueueDirection;
    use crate::queue::BufferState;
    use crate::queue::MAX_BUFFERS;
    use crate::role::Role;

    use super::super::fake::device_for_role;
    use super::super::fake::device_with_config;
    use super::super::fake::queue_buffer;
    use super::super::fake::start_streaming;
    use super::super::fake::FakeAccelerator;
    use super::super::CodecDevice;

    #[test]
    fn reqbufs_creates_component_lazily() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        assert!(session.component().is_none());

        assert_eq!(
            device.reqbufs(&mut session, QueueDirection::Output, 3),
            Ok(3)
        );
        let size = session.queue(QueueDirection::Output).state.size_image;
        let fake = session.fake();
        assert_eq!(fake.input.current_buffer.num, 4);
        assert_eq!(fake.input.current_buffer.size, size);
        assert_eq!(fake.param_u32(PortId::Input, ParameterId::ZeroCopy), Some(1));
        assert_eq!(fake.param_u32(PortId::Output, ParameterId::ZeroCopy), Some(1));
        assert_eq!(session.queue(QueueDirection::Output).buffers.num_buffers(), 3);

        assert_eq!(device.reqbufs(&mut session, QueueDirection::Output, 0), Ok(0));
        assert_eq!(session.queue(QueueDirection::Output).buffers.num_buffers(), 0);
        assert_eq!(device.lock().created, 2);
    }

    #[test]
    fn reqbufs_honors_port_minimum() {
        let mut accel = FakeAccelerator::for_role(Role::Decode);
        accel.min_buffers = 6;
        let device = CodecDevice::new(accel, Role::Decode, DeviceConfig::default()).unwrap();
        let mut session = device.new_session(0, ()).unwrap();

        assert_eq!(
            device.reqbufs(&mut session, QueueDirection::Capture, 2),
            Ok(6)
        );
        assert_eq!(session.fake().output.current_buffer.num, 7);
    }

    #[test]
    fn component_creation_failures() {
        let device = device_for_role(Role::Encode);
        let mut session = device.new_session(0, ()).unwrap();
        device.lock().fail_create = true;
        assert_eq!(
            device.reqbufs(&mut session, QueueDirection::Output, 2),
            Err(libc::ENOMEM)
        );
        assert!(session.component().is_none());
    }

    #[test]
    fn creation_parameters_per_role() {
        let device = device_for_role(Role::Decode);
        let mut session = device.new_session(0, ()).unwrap();
        device.reqbufs(&mut session, QueueDirection::Output, 2).unwrap();
        let fake = session.fake();
        assert_eq!(
            fake.param_u32(PortId::Output, ParameterId::VideoValidateTimestamps),
            Some(0)
        );
        assert_eq!(
            fake.param_u32(PortId::Control, ParameterId::VideoStopOnParColourChange),
            Some(1)
        );
        assert_eq!(fake.format_pushes.len(), 2);

        let device = device_for_role(Role::Encode);
        let mut session = device.new_session(0, ()).unwrap();
        device.reqbufs(&mut session, QueueDirection::Output, 2).unwrap();
        let fake = session.fake();
        for (port, id) in [
            (PortId::Output, ParameterId::VideoEncodeSpsTiming),
            (PortId::Control, ParameterId::VideoEncodeHeadersWithFrame),
            (PortId::Control, ParameterId::MinimiseFragmentation),
            (PortId::Output, ParameterId::VideoEncodeSeiEnable),
        ] {
            assert_eq!(fake.param_u32(port, id), Some(1), "{:?}", id);
        }
        // Cached controls are applied to the new component.
        assert_eq!(
            fake.param_u32(PortId::Output, ParameterId::VideoBitRate),
            Some(10_000_000)
        );

        let device = device_for_role(Role::EncodeImage);
        let mut session = device.new_session(0, ()).unwrap();
        device.reqbufs(&mut session, QueueDirection::Output, 2).unwrap();
        let fake = session.fake();
        assert_eq!(fake.param_u32(PortId::Control, ParameterId::ExifDisable), Some(0));
        assert_eq!(fake.param_u32(PortId::Output, ParameterId::JpegIjgScaling), Some(1));
        assert_eq!(fake.param_u32(PortId::Output, ParameterId::JpegQFactor), Some(80));
    }

    #[test]
    fn deinterlace_algorithm_depends_on_width() {
        let effect_of = |device: &CodecDevice<FakeAccelerator>, width: u32| {
            let mut session = device.new_session(0, ()).unwrap();
            device
                .s_fmt(
                    &mut session,
                    QueueDirection::Output,
                    Format::new(PixelFormat::YUV420, width, 576),
                )
                .unwrap();
            device.reqbufs(&mut session, QueueDirection::Output, 2).unwrap();
            let value = session
                .fake()
                .param(PortId::Output, ParameterId::ImageEffectParameters)
                .unwrap()
                .to_vec();
            let params = ImageFxParameters::read_from(value.as_slice()).unwrap();
            assert_eq!(params.num_effect_params, 4);
            assert_eq!(params.effect_parameter[..4], [5, u32::MAX, 0, 0]);
            params.effect
        };

        let device = device_for_role(Role::Deinterlace);
        assert_eq!(effect_of(&device, 720), ImageEffect::DeinterlaceAdvanced as u32);
        assert_eq!(effect_of(&device, 1280), ImageEffect::DeinterlaceFast as u32);

        let device = device_with_config(
            Role::Deinterlace,
            DeviceConfig {
                advanced_deinterlace: false,
                ..Default::default()
            },
        );
        assert_eq!(effect_of(&device, 720), ImageEffect::DeinterlaceFast as u32);
    }

    #[test]
    fn initial_format_failure_destroys_component() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        device.lock().fail_format = true;
        assert_eq!(
            device.reqbufs(&mut session, QueueDirection::Output, 2),
            Err(libc::EINVAL)
        );
        assert!(session.component().is_none());
        assert_eq!(session.queue(QueueDirection::Output).buffers.num_buffers(), 0);

        let accel = device.lock();
        assert_eq!(accel.created, 2);
        assert_eq!(accel.destroyed, 2);
    }

    #[test]
    fn streaming_enables_ports_and_eos_buffer() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        assert_eq!(
            device.streamon(&mut session, QueueDirection::Output),
            Err(libc::EINVAL)
        );

        device.reqbufs(&mut session, QueueDirection::Output, 2).unwrap();
        device.streamon(&mut session, QueueDirection::Output).unwrap();
        assert!(session.queue(QueueDirection::Output).buffers.is_streaming());
        assert!(session.queue(QueueDirection::Output).state.eos_buffer.is_some());
        let fake = session.fake();
        assert!(fake.is_enabled());
        assert!(fake.input.enabled);
        assert!(!fake.output.enabled);

        // Streaming again is a no-op.
        device.streamon(&mut session, QueueDirection::Output).unwrap();
        assert_eq!(
            device.reqbufs(&mut session, QueueDirection::Output, 4),
            Err(libc::EBUSY)
        );

        device.streamoff(&mut session, QueueDirection::Output).unwrap();
        assert!(session.queue(QueueDirection::Output).state.eos_buffer.is_none());
        let fake = session.fake();
        assert!(!fake.input.enabled);
        assert!(!fake.is_enabled());
    }

    #[test]
    fn decoder_restarts_enabled_output_port() {
        let device = device_for_role(Role::Decode);
        let mut session = device.new_session(0, ()).unwrap();
        device.reqbufs(&mut session, QueueDirection::Output, 2).unwrap();
        device.reqbufs(&mut session, QueueDirection::Capture, 4).unwrap();
        device.streamon(&mut session, QueueDirection::Output).unwrap();
        assert!(session.fake().output.enabled);
        device
            .streamon(&mut session, QueueDirection::Capture)
            .unwrap();
        let fake = session.fake();
        assert_eq!(fake.output.current_buffer.num, 5);
        assert_eq!(fake.port_disables, vec![PortId::Output]);

        queue_buffer(&mut session, QueueDirection::Capture, 0, 0);
        session.submit_next(QueueDirection::Capture);
        assert_eq!(session.fake().output.buffers_in_flight(), 1);

        // Stopping CAPTURE mid-stream keeps the output port enabled for format changes.
        device
            .streamoff(&mut session, QueueDirection::Capture)
            .unwrap();
        let fake = session.fake();
        assert!(fake.output.enabled);
        assert_eq!(fake.output.buffers_in_flight(), 0);
        assert_eq!(fake.port_disables.len(), 2);

        device
            .streamon(&mut session, QueueDirection::Capture)
            .unwrap();
        let fake = session.fake();
        assert_eq!(fake.port_disables, vec![PortId::Output; 3]);
        assert!(fake.output.enabled);
        assert_eq!(fake.output.current_buffer.num, 5);
        assert_eq!(fake.format_pushes.last().unwrap().2.num, 5);
        // The buffer held across the restart is given back to the client, not lost.
        assert_eq!(
            session.queue(QueueDirection::Capture).buffers.count_in_state(BufferState::Dequeued),
            4
        );

        queue_buffer(&mut session, QueueDirection::Capture, 0, 0);
        session.submit_next(QueueDirection::Capture);
        assert_eq!(session.fake().output.buffers_in_flight(), 1);
    }

    #[test]
    fn buffer_counts_are_capped() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        assert_eq!(
            device.reqbufs(&mut session, QueueDirection::Output, u32::MAX),
            Ok(MAX_BUFFERS)
        );
        assert_eq!(
            session.queue(QueueDirection::Output).buffers.num_buffers(),
            MAX_BUFFERS as usize
        );
        assert_eq!(session.fake().input.current_buffer.num, MAX_BUFFERS + 1);

        let size = session.queue(QueueDirection::Output).state.size_image;
        assert_eq!(
            device.create_bufs(&mut session, QueueDirection::Output, u32::MAX, size),
            Err(libc::ENOBUFS)
        );

        device.reqbufs(&mut session, QueueDirection::Output, 2).unwrap();
        device.streamon(&mut session, QueueDirection::Output).unwrap();
        assert_eq!(
            device.create_bufs(&mut session, QueueDirection::Output, u32::MAX, size),
            Ok(2)
        );
        assert_eq!(
            session.queue(QueueDirection::Output).buffers.num_buffers(),
            MAX_BUFFERS as usize
        );
        let fake = session.fake();
        assert!(fake.input.enabled);
        assert_eq!(fake.input.current_buffer.num, MAX_BUFFERS + 1);
    }

    #[test]
    fn streamoff_returns_every_buffer_once() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        start_streaming(&device, &mut session, 4);

        for index in 0..4 {
            queue_buffer(&mut session, QueueDirection::Output, index, 100);
        }
        session.submit_next(QueueDirection::Output);
        session.submit_next(QueueDirection::Output);
        session.submit_next(QueueDirection::Output);
        session
            .fake()
            .complete(PortId::Input, 100, HeaderFlags::empty());
        session.process_messages();

        let output = &session.queue(QueueDirection::Output).buffers;
        assert_eq!(output.count_in_state(BufferState::Done), 1);
        assert_eq!(output.count_in_state(BufferState::InFlight), 2);
        assert_eq!(output.count_in_state(BufferState::Queued), 1);

        device.streamoff(&mut session, QueueDirection::Output).unwrap();

        let output = &session.queue(QueueDirection::Output).buffers;
        assert_eq!(output.count_in_state(BufferState::Dequeued), 4);
        assert_eq!(session.fake().submitted.len(), 3);
        assert_eq!(session.fake().input.buffers_in_flight(), 0);
        // The completed buffer and the two returned by the disable.
        assert_eq!(session.num_input_buffers(), 3);
        assert_eq!(session.dqbuf(QueueDirection::Output), Err(libc::EAGAIN));

        // Late duplicates are ignored.
        assert_eq!(session.process_messages(), 0);
    }

    #[test]
    fn drain_timeout_is_not_fatal() {
        let device = device_with_config(
            Role::Isp,
            DeviceConfig {
                drain_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let mut session = device.new_session(0, ()).unwrap();
        start_streaming(&device, &mut session, 2);

        queue_buffer(&mut session, QueueDirection::Output, 0, 100);
        session.submit_next(QueueDirection::Output);
        session.fake().hold_on_disable = true;

        device.streamoff(&mut session, QueueDirection::Output).unwrap();
        assert!(!session.queue(QueueDirection::Output).buffers.is_streaming());
        assert_eq!(
            session
                .queue(QueueDirection::Output)
                .buffers
                .buffer(0)
                .unwrap()
                .state(),
            BufferState::InFlight
        );

        // The buffer comes back eventually.
        session
            .fake()
            .complete(PortId::Input, 100, HeaderFlags::empty());
        session.process_messages();
        assert_eq!(
            session
                .queue(QueueDirection::Output)
                .buffers
                .buffer(0)
                .unwrap()
                .state(),
            BufferState::Dequeued
        );
    }

    #[test]
    fn create_bufs_grows_streaming_port() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        start_streaming(&device, &mut session, 2);
        let size = session.queue(QueueDirection::Output).state.size_image;
        assert_eq!(session.fake().input.current_buffer.num, 3);

        assert_eq!(
            device.create_bufs(&mut session, QueueDirection::Output, 2, size - 1),
            Err(libc::EINVAL)
        );

        queue_buffer(&mut session, QueueDirection::Output, 0, 100);
        queue_buffer(&mut session, QueueDirection::Output, 1, 100);
        session.submit_next(QueueDirection::Output);

        assert_eq!(
            device.create_bufs(&mut session, QueueDirection::Output, 2, size),
            Ok(2)
        );
        let fake = session.fake();
        assert_eq!(fake.port_disables, vec![PortId::Input]);
        assert!(fake.input.enabled);
        assert_eq!(fake.input.current_buffer.num, 5);
        assert_eq!(fake.format_pushes.last().unwrap().2.num, 5);

        // The in-flight buffer is queued again ahead of the other one, and nothing is lost.
        let output = &session.queue(QueueDirection::Output).buffers;
        assert_eq!(output.num_buffers(), 4);
        assert_eq!(output.count_in_state(BufferState::Queued), 2);
        assert_eq!(output.count_in_state(BufferState::Dequeued), 2);
        session.submit_next(QueueDirection::Output);
        assert_eq!(
            session.fake().submitted.last().unwrap().1.tag,
            crate::accel::BufferTag::Slot(0)
        );
    }

    #[test]
    fn create_bufs_on_stopped_queue() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        let size = session.queue(QueueDirection::Capture).state.size_image;

        assert_eq!(
            device.create_bufs(&mut session, QueueDirection::Capture, 3, size * 2),
            Ok(0)
        );
        assert_eq!(
            device.create_bufs(&mut session, QueueDirection::Capture, 1, size),
            Ok(3)
        );
        assert!(session.fake().port_disables.is_empty());

        device
            .streamon(&mut session, QueueDirection::Capture)
            .unwrap();
        assert_eq!(session.fake().output.current_buffer.num, 5);
    }
}
