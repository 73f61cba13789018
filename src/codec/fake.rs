// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process accelerator used by the tests of the transform sessions.
//!
//! Components hold the submitted buffers until a test completes them, and give them back through
//! the session's message channel like the real transport does.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::mpsc::Sender;

use zerocopy::AsBytes;

use crate::accel::encoding;
use crate::accel::params::FormatChangedEvent;
use crate::accel::AccelError;
use crate::accel::AcceleratorComponent;
use crate::accel::AcceleratorService;
use crate::accel::BufferHeader;
use crate::accel::BufferRequirements;
use crate::accel::HeaderFlags;
use crate::accel::ParameterId;
use crate::accel::Port;
use crate::accel::PortFormat;
use crate::accel::PortId;
use crate::accel::PortMessage;
use crate::accel::EVENT_FORMAT_CHANGED;
use crate::config::DeviceConfig;
use crate::protocol::QueueDirection;
use crate::queue::ClientBuffer;
use crate::role::Role;
use crate::ClientEventQueue;

use super::CodecDevice;
use super::CodecSession;

pub struct FakeAccelerator {
    pub input_encodings: Vec<u32>,
    pub output_encodings: Vec<u32>,
    /// Minimum number of buffers of the ports of the created components.
    pub min_buffers: u32,
    pub fail_create: bool,
    /// Make the format pushes of the created components fail.
    pub fail_format: bool,
    pub created: usize,
    pub destroyed: usize,
}

impl FakeAccelerator {
    pub fn for_role(role: Role) -> Self {
        let (input_encodings, output_encodings) = match role {
            Role::Decode => (
                vec![encoding::H264, encoding::MJPEG, encoding::MP2V],
                vec![
                    encoding::I420,
                    encoding::NV12,
                    encoding::YUVUV128,
                    encoding::RGB16,
                ],
            ),
            Role::Encode => (
                vec![encoding::I420, encoding::NV12, encoding::RGB24],
                vec![encoding::H264],
            ),
            Role::Isp => (
                vec![
                    encoding::I420,
                    encoding::NV12,
                    encoding::YUYV,
                    encoding::RGB24,
                    encoding::BAYER_SRGGB10P,
                ],
                vec![
                    encoding::I420,
                    encoding::NV12,
                    encoding::RGB24,
                    encoding::BGRA,
                ],
            ),
            Role::Deinterlace => (
                vec![encoding::I420, encoding::YUVUV128],
                vec![encoding::I420, encoding::YUVUV128],
            ),
            Role::EncodeImage => (
                vec![encoding::I420, encoding::NV12],
                vec![encoding::JPEG],
            ),
        };

        Self {
            input_encodings,
            output_encodings,
            min_buffers: 1,
            fail_create: false,
            fail_format: false,
            created: 0,
            destroyed: 0,
        }
    }
}

impl AcceleratorService for FakeAccelerator {
    type Component = FakeComponent;

    fn create_component(&mut self, name: &str) -> Result<FakeComponent, AccelError> {
        if self.fail_create {
            return Err(AccelError::NoSuchComponent(name.into()));
        }

        self.created += 1;
        let mut component = FakeComponent::new(self.min_buffers);
        component.fail_format = self.fail_format;
        Ok(component)
    }

    fn destroy_component(&mut self, _component: FakeComponent) {
        self.destroyed += 1;
    }

    fn supported_encodings(
        &mut self,
        _component: &mut FakeComponent,
        port: PortId,
    ) -> Result<Vec<u32>, AccelError> {
        match port {
            PortId::Input => Ok(self.input_encodings.clone()),
            PortId::Output => Ok(self.output_encodings.clone()),
            PortId::Control => Err(AccelError::Transport(libc::EINVAL)),
        }
    }
}

pub struct FakeComponent {
    pub input: Port,
    pub output: Port,
    pub control: Port,
    pub enabled: bool,
    /// Channel given by the last `enable_port` of each port.
    senders: HashMap<PortId, Sender<PortMessage>>,
    /// Buffers currently held, in submission order.
    pub held: VecDeque<(PortId, BufferHeader)>,
    /// Every buffer ever submitted.
    pub submitted: Vec<(PortId, BufferHeader)>,
    /// Every parameter set, in order.
    pub params: Vec<(PortId, ParameterId, Vec<u8>)>,
    /// Current parameter values, returned by `get_parameter`.
    pub stored_params: HashMap<(PortId, ParameterId), Vec<u8>>,
    pub format_pushes: Vec<(PortId, PortFormat, BufferRequirements)>,
    /// Parameters whose `set` fails.
    pub rejected_params: Vec<ParameterId>,
    pub fail_submit: bool,
    pub fail_format: bool,
    /// Keep the held buffers when a port is disabled, as a hung accelerator would.
    pub hold_on_disable: bool,
    pub port_disables: Vec<PortId>,
}

impl FakeComponent {
    fn new(min_buffers: u32) -> Self {
        let minimum = BufferRequirements {
            num: min_buffers,
            size: 0,
        };

        Self {
            input: Port::new(minimum),
            output: Port::new(minimum),
            control: Port::default(),
            enabled: false,
            senders: Default::default(),
            held: Default::default(),
            submitted: Default::default(),
            params: Default::default(),
            stored_params: Default::default(),
            format_pushes: Default::default(),
            rejected_params: Default::default(),
            fail_submit: false,
            fail_format: false,
            hold_on_disable: false,
            port_disables: Default::default(),
        }
    }

    fn send(&self, message: PortMessage) {
        let port = match &message {
            PortMessage::BufferDone { port, .. } | PortMessage::Event { port, .. } => *port,
        };
        if let Some(sender) = self.senders.get(&port) {
            let _ = sender.send(message);
        }
    }

    fn take_held(&mut self, port: PortId) -> Option<BufferHeader> {
        let position = self.held.iter().position(|(p, _)| *p == port)?;
        let (_, header) = self.held.remove(position)?;
        self.port(port).in_flight.decrement();
        Some(header)
    }

    pub fn held_on(&self, port: PortId) -> usize {
        self.held.iter().filter(|(p, _)| *p == port).count()
    }

    /// Return the oldest buffer held on `port` with `length` valid bytes and `flags`.
    pub fn complete(
        &mut self,
        port: PortId,
        length: u32,
        flags: HeaderFlags,
    ) -> Option<BufferHeader> {
        let mut header = self.take_held(port)?;
        header.length = length;
        header.flags = flags;
        self.send(PortMessage::BufferDone {
            port,
            status: Ok(()),
            header: header.clone(),
        });

        Some(header)
    }

    /// Return the oldest buffer held on `port` with an error.
    pub fn fail_next(&mut self, port: PortId) -> Option<BufferHeader> {
        let header = self.take_held(port)?;
        self.send(PortMessage::BufferDone {
            port,
            status: Err(AccelError::Transport(libc::EIO)),
            header: header.clone(),
        });

        Some(header)
    }

    pub fn send_format_changed(&self, event: &FormatChangedEvent) {
        self.send(PortMessage::Event {
            port: PortId::Output,
            cmd: EVENT_FORMAT_CHANGED,
            payload: event.as_bytes().to_vec(),
        });
    }

    pub fn send_event(&self, port: PortId, cmd: u32, payload: Vec<u8>) {
        self.send(PortMessage::Event { port, cmd, payload });
    }

    /// Last value set for parameter `id` of `port`.
    pub fn param(&self, port: PortId, id: ParameterId) -> Option<&[u8]> {
        self.params
            .iter()
            .rev()
            .find(|(p, i, _)| *p == port && *i == id)
            .map(|(_, _, value)| value.as_slice())
    }

    pub fn param_u32(&self, port: PortId, id: ParameterId) -> Option<u32> {
        let value = self.param(port, id)?;
        Some(u32::from_ne_bytes(value.get(..4)?.try_into().ok()?))
    }
}

impl AcceleratorComponent for FakeComponent {
    fn port(&self, port: PortId) -> &Port {
        match port {
            PortId::Control => &self.control,
            PortId::Input => &self.input,
            PortId::Output => &self.output,
        }
    }

    fn port_mut(&mut self, port: PortId) -> &mut Port {
        match port {
            PortId::Control => &mut self.control,
            PortId::Input => &mut self.input,
            PortId::Output => &mut self.output,
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn enable(&mut self) -> Result<(), AccelError> {
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), AccelError> {
        self.enabled = false;
        Ok(())
    }

    fn set_port_format(&mut self, port: PortId) -> Result<(), AccelError> {
        if self.fail_format {
            return Err(AccelError::Transport(libc::EIO));
        }

        let (format, current_buffer) = {
            let p = self.port(port);
            (p.format, p.current_buffer)
        };
        self.format_pushes.push((port, format, current_buffer));
        Ok(())
    }

    fn get_parameter(
        &mut self,
        port: PortId,
        id: ParameterId,
        value: &mut [u8],
    ) -> Result<usize, AccelError> {
        let stored = self
            .stored_params
            .get(&(port, id))
            .ok_or(AccelError::ParameterRejected(id))?;
        let len = stored.len().min(value.len());
        value[..len].copy_from_slice(&stored[..len]);

        Ok(len)
    }

    fn set_parameter(
        &mut self,
        port: PortId,
        id: ParameterId,
        value: &[u8],
    ) -> Result<(), AccelError> {
        if self.rejected_params.contains(&id) {
            return Err(AccelError::ParameterRejected(id));
        }

        self.params.push((port, id, value.to_vec()));
        self.stored_params.insert((port, id), value.to_vec());
        Ok(())
    }

    fn enable_port(
        &mut self,
        port: PortId,
        messages: Sender<PortMessage>,
    ) -> Result<(), AccelError> {
        if port == PortId::Control {
            return Err(AccelError::Transport(libc::EINVAL));
        }

        self.senders.insert(port, messages);
        self.port_mut(port).enabled = true;
        Ok(())
    }

    fn disable_port(&mut self, port: PortId) -> Result<(), AccelError> {
        self.port_disables.push(port);
        let p = self.port_mut(port);
        p.enabled = false;
        // Disabling a port resets its buffer configuration.
        p.current_buffer.num = p.minimum_buffer.num;

        if !self.hold_on_disable {
            while let Some(mut header) = self.take_held(port) {
                if port == PortId::Output {
                    header.length = 0;
                    header.flags = HeaderFlags::empty();
                }
                self.send(PortMessage::BufferDone {
                    port,
                    status: Ok(()),
                    header,
                });
            }
        }

        Ok(())
    }

    fn submit_buffer(&mut self, port: PortId, header: BufferHeader) -> Result<(), AccelError> {
        if !self.port(port).enabled {
            return Err(AccelError::PortDisabled);
        }
        if self.fail_submit {
            return Err(AccelError::Transport(libc::EIO));
        }

        self.port(port).in_flight.increment();
        self.submitted.push((port, header.clone()));
        self.held.push_back((port, header));
        Ok(())
    }
}

pub fn device_with_config(role: Role, config: DeviceConfig) -> CodecDevice<FakeAccelerator> {
    CodecDevice::new(FakeAccelerator::for_role(role), role, config).unwrap()
}

pub fn device_for_role(role: Role) -> CodecDevice<FakeAccelerator> {
    device_with_config(role, DeviceConfig::default())
}

impl<E: ClientEventQueue> CodecSession<FakeAccelerator, E> {
    pub fn fake(&mut self) -> &mut FakeComponent {
        self.component.as_mut().unwrap()
    }
}

/// Allocate `count` buffers on both queues of `session` and start streaming them.
pub fn start_streaming<E: ClientEventQueue>(
    device: &CodecDevice<FakeAccelerator>,
    session: &mut CodecSession<FakeAccelerator, E>,
    count: u32,
) {
    for direction in [QueueDirection::Output, QueueDirection::Capture] {
        device.reqbufs(session, direction, count).unwrap();
        device.streamon(session, direction).unwrap();
    }
}

/// Queue buffer `index` of `direction` with `bytes_used` valid bytes.
pub fn queue_buffer<E: ClientEventQueue>(
    session: &mut CodecSession<FakeAccelerator, E>,
    direction: QueueDirection,
    index: u32,
    bytes_used: u32,
) {
    session
        .qbuf(
            direction,
            ClientBuffer {
                index,
                bytes_used,
                ..Default::default()
            },
        )
        .unwrap();
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use crate::accel::AcceleratorComponent;
    use crate::accel::BufferHeader;
    use crate::accel::BufferTag;
    use crate::accel::HeaderFlags;
    use crate::accel::PortId;
    use crate::accel::PortMessage;

    use super::FakeComponent;

    #[test]
    fn messages_follow_their_port() {
        let mut component = FakeComponent::new(1);
        let (input_tx, input_rx) = channel();
        let (output_tx, output_rx) = channel();
        component.enable_port(PortId::Input, input_tx).unwrap();
        component.enable_port(PortId::Output, output_tx).unwrap();

        component
            .submit_buffer(PortId::Input, BufferHeader::new(BufferTag::Slot(0), 16))
            .unwrap();
        component
            .submit_buffer(PortId::Output, BufferHeader::new(BufferTag::Slot(1), 16))
            .unwrap();
        component.complete(PortId::Input, 16, HeaderFlags::empty());
        component.complete(PortId::Output, 8, HeaderFlags::empty());

        match input_rx.try_recv() {
            Ok(PortMessage::BufferDone { port, header, .. }) => {
                assert_eq!(port, PortId::Input);
                assert_eq!(header.tag, BufferTag::Slot(0));
            }
            _ => panic!("no buffer returned on the input channel"),
        }
        assert!(input_rx.try_recv().is_err());

        match output_rx.try_recv() {
            Ok(PortMessage::BufferDone { port, header, .. }) => {
                assert_eq!(port, PortId::Output);
                assert_eq!(header.tag, BufferTag::Slot(1));
            }
            _ => panic!("no buffer returned on the output channel"),
        }
        assert!(output_rx.try_recv().is_err());
    }
}
