// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Transform devices and their sessions.
//!
//! A [`CodecDevice`] is one instance of a [`Role`], bound to the accelerator service. Each client
//! opening the device gets a [`CodecSession`], which owns the two queues of the client and, once
//! buffers are requested, an accelerator component performing the transform.
//!
//! Operations that reconfigure a session (format negotiation, buffer allocation, streaming state)
//! are methods of the device, which serializes them across all its sessions. Operations on
//! buffers (queueing, dequeueing, processing the messages of the accelerator) only need the
//! session.

mod exchange;
mod format_change;
mod lifecycle;
mod negotiation;

pub mod controls;
pub mod job;

#[cfg(test)]
mod fake;

use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use anyhow::Context;
use log::debug;
use log::error;

use crate::accel::AcceleratorComponent;
use crate::accel::AcceleratorService;
use crate::accel::BufferHeader;
use crate::accel::PortId;
use crate::accel::PortMessage;
use crate::config::DeviceConfig;
use crate::format::FormatCatalog;
use crate::format::FormatDescriptor;
use crate::geometry::buffer_size_for;
use crate::geometry::stride_for;
use crate::geometry::DEFAULT_HEIGHT;
use crate::geometry::DEFAULT_WIDTH;
use crate::geometry::MIN_HEIGHT;
use crate::geometry::MIN_WIDTH;
use crate::protocol::ClientEvent;
use crate::protocol::Colorimetry;
use crate::protocol::Field;
use crate::protocol::Format;
use crate::protocol::Fraction;
use crate::protocol::FrameSizeStepwise;
use crate::protocol::PixelFormat;
use crate::protocol::QueueDirection;
use crate::queue::BufferQueue;
use crate::role::Role;
use crate::ClientEventQueue;
use crate::IoctlResult;

use controls::Controls;

/// Frame rate of new sessions.
const DEFAULT_FRAME_RATE: Fraction = Fraction {
    numerator: 30,
    denominator: 1,
};

/// Geometry and stream state of one queue of a session.
#[derive(Debug, Clone)]
pub struct QueueState {
    pub format: &'static FormatDescriptor,
    pub bytes_per_line: u32,
    /// Height of the buffers, in lines.
    pub height: u32,
    pub crop_width: u32,
    pub crop_height: u32,
    /// Set when the crop rectangle has been chosen by the client or the accelerator, in which case
    /// format requests on uncompressed formats keep the current crop height.
    pub crop_explicit: bool,
    pub aspect_ratio: Fraction,
    pub field: Field,
    pub size_image: u32,
    /// Sequence number of the next buffer returned on this queue.
    pub sequence: u32,
    /// Reserved end-of-stream buffer. Only present on the `OUTPUT` queue while it is streaming.
    pub eos_buffer: Option<BufferHeader>,
    /// Whether the end-of-stream buffer is currently held by the accelerator.
    pub eos_in_use: bool,
}

impl QueueState {
    fn new(format: &'static FormatDescriptor, role: Role) -> Self {
        let bytes_per_line = stride_for(DEFAULT_WIDTH, DEFAULT_HEIGHT, format, role);
        Self {
            format,
            bytes_per_line,
            height: DEFAULT_HEIGHT,
            crop_width: DEFAULT_WIDTH,
            crop_height: DEFAULT_HEIGHT,
            crop_explicit: false,
            aspect_ratio: Fraction::new(1, 1),
            field: Field::None,
            size_image: buffer_size_for(bytes_per_line, DEFAULT_WIDTH, DEFAULT_HEIGHT, format),
            sequence: 0,
            eos_buffer: None,
            eos_in_use: false,
        }
    }
}

/// One of the two queues of a session.
#[derive(Debug)]
pub struct SessionQueue {
    pub state: QueueState,
    pub buffers: BufferQueue,
}

impl SessionQueue {
    fn new(direction: QueueDirection, format: &'static FormatDescriptor, role: Role) -> Self {
        Self {
            state: QueueState::new(format, role),
            buffers: BufferQueue::new(direction),
        }
    }
}

/// A client's open handle on a [`CodecDevice`].
pub struct CodecSession<A: AcceleratorService, E: ClientEventQueue> {
    id: u32,
    role: Role,
    config: DeviceConfig,

    /// Source buffers, consumed by the input port of the component.
    output: SessionQueue,
    /// Destination buffers, filled by the output port of the component.
    capture: SessionQueue,

    /// Created when buffers are first requested, and destroyed with the session.
    component: Option<A::Component>,

    /// Colorimetry shared by both queues.
    colorimetry: Colorimetry,
    controls: Controls,
    frame_rate: Fraction,

    /// Set by the scheduler to stop submitting buffers until the next stream stop.
    aborting: bool,

    num_input_buffers: u64,
    num_output_buffers: u64,

    eos_subscribed: bool,
    src_change_subscribed: bool,
    events: E,

    /// Given to the component when enabling a port.
    message_sender: Sender<PortMessage>,
    messages: Receiver<PortMessage>,
}

impl<A: AcceleratorService, E: ClientEventQueue> CodecSession<A, E> {
    fn new(
        id: u32,
        role: Role,
        config: DeviceConfig,
        output_format: &'static FormatDescriptor,
        capture_format: &'static FormatDescriptor,
        events: E,
    ) -> Self {
        let (message_sender, messages) = mpsc::channel();

        Self {
            id,
            role,
            config,
            output: SessionQueue::new(QueueDirection::Output, output_format, role),
            capture: SessionQueue::new(QueueDirection::Capture, capture_format, role),
            component: None,
            colorimetry: Default::default(),
            controls: Default::default(),
            frame_rate: DEFAULT_FRAME_RATE,
            aborting: false,
            num_input_buffers: 0,
            num_output_buffers: 0,
            eos_subscribed: false,
            src_change_subscribed: false,
            events,
            message_sender,
            messages,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn queue(&self, direction: QueueDirection) -> &SessionQueue {
        match direction {
            QueueDirection::Output => &self.output,
            QueueDirection::Capture => &self.capture,
        }
    }

    fn queue_mut(&mut self, direction: QueueDirection) -> &mut SessionQueue {
        match direction {
            QueueDirection::Output => &mut self.output,
            QueueDirection::Capture => &mut self.capture,
        }
    }

    pub fn component(&self) -> Option<&A::Component> {
        self.component.as_ref()
    }

    pub fn colorimetry(&self) -> Colorimetry {
        self.colorimetry
    }

    /// Number of `OUTPUT` buffers consumed by the accelerator so far.
    pub fn num_input_buffers(&self) -> u64 {
        self.num_input_buffers
    }

    /// Number of `CAPTURE` buffers produced by the accelerator so far.
    pub fn num_output_buffers(&self) -> u64 {
        self.num_output_buffers
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    /// Current format of the `direction` queue.
    pub fn current_format(&self, direction: QueueDirection) -> Format {
        let state = &self.queue(direction).state;

        Format {
            pixel_format: state.format.pixel_format,
            width: state.crop_width,
            height: state.height,
            field: state.field,
            bytes_per_line: state.bytes_per_line,
            size_image: state.size_image,
            colorimetry: self.colorimetry,
        }
    }

    pub fn subscribe_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::EndOfStream => self.eos_subscribed = true,
            ClientEvent::ResolutionChanged => self.src_change_subscribed = true,
        }
    }

    /// Stop receiving `event`, or every event if `None`.
    pub fn unsubscribe_event(&mut self, event: Option<ClientEvent>) {
        match event {
            Some(ClientEvent::EndOfStream) => self.eos_subscribed = false,
            Some(ClientEvent::ResolutionChanged) => self.src_change_subscribed = false,
            None => {
                self.eos_subscribed = false;
                self.src_change_subscribed = false;
            }
        }
    }

    /// Send `event` to the client if it subscribed to it.
    fn send_event(&mut self, event: ClientEvent) {
        let subscribed = match event {
            ClientEvent::EndOfStream => self.eos_subscribed,
            ClientEvent::ResolutionChanged => self.src_change_subscribed,
        };

        if subscribed {
            self.events.send_event(event);
        } else {
            debug!("session {}: dropping unsubscribed event {:?}", self.id, event);
        }
    }
}

/// An instance of a transform role, shared by all the sessions opened on it.
pub struct CodecDevice<A: AcceleratorService> {
    role: Role,
    config: DeviceConfig,
    catalog: FormatCatalog,
    /// Also serializes the reconfiguration of all the sessions of the device.
    service: Mutex<A>,
}

impl<A: AcceleratorService> CodecDevice<A> {
    /// Create a device for `role`, building its format catalog from the encodings supported by the
    /// role's component.
    pub fn new(mut service: A, role: Role, config: DeviceConfig) -> anyhow::Result<Self> {
        let name = role.config().component;
        let mut component = service
            .create_component(name)
            .with_context(|| format!("failed to create component {} to probe formats", name))?;
        let input_encodings = service.supported_encodings(&mut component, PortId::Input);
        let output_encodings = service.supported_encodings(&mut component, PortId::Output);
        service.destroy_component(component);

        let input_encodings =
            input_encodings.context("failed to query the encodings of the input port")?;
        let output_encodings =
            output_encodings.context("failed to query the encodings of the output port")?;

        let catalog = FormatCatalog::from_encodings(
            &input_encodings,
            &output_encodings,
            config.disable_bayer,
        );
        if catalog.formats(QueueDirection::Output).is_empty()
            || catalog.formats(QueueDirection::Capture).is_empty()
        {
            anyhow::bail!(
                "component {} does not support any known format on one of its ports",
                name
            );
        }

        debug!(
            "{} device: {} OUTPUT formats, {} CAPTURE formats",
            role.config().name,
            catalog.formats(QueueDirection::Output).len(),
            catalog.formats(QueueDirection::Capture).len()
        );

        Ok(Self {
            role,
            config,
            catalog,
            service: Mutex::new(service),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn catalog(&self) -> &FormatCatalog {
        &self.catalog
    }

    fn lock(&self) -> MutexGuard<'_, A> {
        self.service.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn new_session<E: ClientEventQueue>(
        &self,
        id: u32,
        events: E,
    ) -> IoctlResult<CodecSession<A, E>> {
        let output_format = self
            .catalog
            .default_format(QueueDirection::Output)
            .ok_or(libc::EINVAL)?;
        let capture_format = self
            .catalog
            .default_format(QueueDirection::Capture)
            .ok_or(libc::EINVAL)?;

        debug!("{} device: opening session {}", self.role.config().name, id);

        Ok(CodecSession::new(
            id,
            self.role,
            self.config.clone(),
            output_format,
            capture_format,
            events,
        ))
    }

    /// Stop `session` and release its component.
    pub fn close_session<E: ClientEventQueue>(&self, mut session: CodecSession<A, E>) {
        for direction in [QueueDirection::Output, QueueDirection::Capture] {
            if session.queue(direction).buffers.is_streaming() {
                if let Err(e) = self.streamoff(&mut session, direction) {
                    error!(
                        "session {}: failed to stop {:?} queue on close: {}",
                        session.id, direction, e
                    );
                }
            }
            session.queue_mut(direction).buffers.free();
        }

        let mut service = self.lock();
        if let Some(mut component) = session.component.take() {
            if component.is_enabled() {
                if let Err(e) = component.disable() {
                    error!("session {}: failed to disable component: {}", session.id, e);
                }
            }
            service.destroy_component(component);
        }

        debug!(
            "{} device: closed session {} after {} input and {} output buffers",
            self.role.config().name,
            session.id,
            session.num_input_buffers,
            session.num_output_buffers
        );
    }

    pub fn enum_fmt(
        &self,
        direction: QueueDirection,
        index: u32,
    ) -> IoctlResult<&'static FormatDescriptor> {
        self.catalog
            .formats(direction)
            .get(index as usize)
            .copied()
            .ok_or(libc::EINVAL)
    }

    pub fn enum_framesizes(
        &self,
        index: u32,
        pixel_format: PixelFormat,
    ) -> IoctlResult<FrameSizeStepwise> {
        if index != 0 || !self.catalog.contains(pixel_format) {
            return Err(libc::EINVAL);
        }

        let config = self.role.config();
        Ok(FrameSizeStepwise {
            min_width: MIN_WIDTH,
            max_width: config.max_width,
            step_width: 2,
            min_height: MIN_HEIGHT,
            max_height: config.max_height,
            step_height: 2,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::accel::AcceleratorComponent;
    use crate::accel::PortId;
    use crate::config::DeviceConfig;
    use crate::protocol::ClientEvent;
    use crate::protocol::Colorspace;
    use crate::protocol::Field;
    use crate::protocol::PixelFormat;
    use crate::protocol::QueueDirection;
    use crate::role::Role;

    use super::fake::device_for_role;
    use super::fake::FakeAccelerator;
    use super::CodecDevice;

    #[test]
    fn device_catalog() {
        let device = device_for_role(Role::Decode);
        assert_eq!(
            device.enum_fmt(QueueDirection::Output, 0).unwrap().pixel_format,
            PixelFormat::H264
        );
        assert_eq!(
            device.enum_fmt(QueueDirection::Capture, 0).unwrap().pixel_format,
            PixelFormat::YUV420
        );
        assert_eq!(device.enum_fmt(QueueDirection::Output, 100), Err(libc::EINVAL));

        let sizes = device.enum_framesizes(0, PixelFormat::H264).unwrap();
        assert_eq!(sizes.min_width, 32);
        assert_eq!(sizes.max_width, 1920);
        assert_eq!(sizes.step_height, 2);
        assert_eq!(device.enum_framesizes(1, PixelFormat::H264), Err(libc::EINVAL));
        assert_eq!(
            device.enum_framesizes(0, PixelFormat::from_fourcc(b"ABCD")),
            Err(libc::EINVAL)
        );

        let isp = device_for_role(Role::Isp);
        assert_eq!(
            isp.enum_framesizes(0, PixelFormat::YUV420).unwrap().max_height,
            16384
        );
    }

    #[test]
    fn device_without_formats() {
        let mut accel = FakeAccelerator::for_role(Role::Encode);
        accel.output_encodings.clear();
        assert!(CodecDevice::new(accel, Role::Encode, DeviceConfig::default()).is_err());

        let mut accel = FakeAccelerator::for_role(Role::Encode);
        accel.fail_create = true;
        assert!(CodecDevice::new(accel, Role::Encode, DeviceConfig::default()).is_err());
    }

    #[test]
    fn session_defaults() {
        let device = device_for_role(Role::Decode);
        let session = device.new_session(3, Vec::new()).unwrap();
        assert_eq!(session.id(), 3);
        assert!(session.component().is_none());

        let format = session.current_format(QueueDirection::Capture);
        assert_eq!(format.width, 32);
        assert_eq!(format.height, 32);
        assert_eq!(format.field, Field::None);
        assert_eq!(format.colorimetry.colorspace, Colorspace::Rec709);
        assert_eq!(
            session.queue(QueueDirection::Capture).state.aspect_ratio.numerator,
            1
        );
    }

    #[test]
    fn events_need_subscription() {
        let device = device_for_role(Role::Decode);
        let mut session = device.new_session(0, Vec::new()).unwrap();

        session.send_event(ClientEvent::EndOfStream);
        assert!(session.events().is_empty());

        session.subscribe_event(ClientEvent::EndOfStream);
        session.subscribe_event(ClientEvent::ResolutionChanged);
        session.send_event(ClientEvent::EndOfStream);
        session.send_event(ClientEvent::ResolutionChanged);
        assert_eq!(
            session.events(),
            &vec![ClientEvent::EndOfStream, ClientEvent::ResolutionChanged]
        );

        session.unsubscribe_event(Some(ClientEvent::EndOfStream));
        session.send_event(ClientEvent::EndOfStream);
        session.send_event(ClientEvent::ResolutionChanged);
        assert_eq!(session.events().len(), 3);

        session.unsubscribe_event(None);
        session.send_event(ClientEvent::ResolutionChanged);
        assert_eq!(session.events().len(), 3);
    }

    #[test]
    fn close_releases_component() {
        let device = device_for_role(Role::Isp);
        let mut session = device.new_session(0, ()).unwrap();
        device
            .reqbufs(&mut session, QueueDirection::Output, 2)
            .unwrap();
        device
            .reqbufs(&mut session, QueueDirection::Capture, 2)
            .unwrap();
        device.streamon(&mut session, QueueDirection::Output).unwrap();
        device
            .streamon(&mut session, QueueDirection::Capture)
            .unwrap();
        assert!(session.component().unwrap().is_enabled());
        assert!(session.component().unwrap().port(PortId::Input).enabled);

        device.close_session(session);
        let accel = device.lock();
        // One component to probe the formats, one for the session.
        assert_eq!(accel.created, 2);
        assert_eq!(accel.destroyed, 2);
    }
}
