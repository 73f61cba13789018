// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Format, selection and stream parameter negotiation, and their translation into port formats.

use log::debug;
use log::error;
use log::warn;

use crate::accel::AccelError;
use crate::accel::AcceleratorComponent;
use crate::accel::AcceleratorService;
use crate::accel::FormatFlags;
use crate::accel::PortFormat;
use crate::accel::PortId;
use crate::format::FormatDescriptor;
use crate::geometry::align_up;
use crate::geometry::buffer_size_for;
use crate::geometry::stride_for;
use crate::geometry::FRAME_HEIGHT_ALIGN;
use crate::geometry::MIN_HEIGHT;
use crate::geometry::MIN_WIDTH;
use crate::protocol::Colorimetry;
use crate::protocol::Colorspace;
use crate::protocol::Field;
use crate::protocol::Format;
use crate::protocol::Fraction;
use crate::protocol::QueueDirection;
use crate::protocol::Rect;
use crate::protocol::SelectionTarget;
use crate::role::Role;
use crate::role::RoleOps;
use crate::ClientEventQueue;
use crate::IoctlResult;

use super::CodecDevice;
use super::CodecSession;
use super::QueueState;

/// Width in pixels of the buffers of `state`.
fn buffer_width(state: &QueueState) -> u32 {
    let format = state.format;
    if format.compressed || format.is_column_format() {
        return state.crop_width;
    }

    state
        .bytes_per_line
        .saturating_mul(8)
        .checked_div(format.depth)
        .unwrap_or(state.crop_width)
}

/// Field to use for content announced as `field`.
fn normalize_field(role: Role, field: Field) -> Field {
    if !role.handles_interlaced() {
        return Field::None;
    }

    match field {
        Field::Interlaced => Field::Interlaced,
        Field::Top | Field::Bottom | Field::InterlacedTb => Field::InterlacedTb,
        Field::InterlacedBt => Field::InterlacedBt,
        _ => Field::None,
    }
}

/// Whether the client can set `target` on the `direction` queue of a `role` device.
fn is_settable(role: Role, direction: QueueDirection, target: SelectionTarget) -> bool {
    matches!(
        (role, direction, target),
        (Role::Decode, QueueDirection::Capture, SelectionTarget::Compose)
            | (
                Role::Encode | Role::EncodeImage,
                QueueDirection::Output,
                SelectionTarget::Crop
            )
            | (
                Role::Isp | Role::Deinterlace,
                QueueDirection::Capture,
                SelectionTarget::Compose
            )
            | (
                Role::Isp | Role::Deinterlace,
                QueueDirection::Output,
                SelectionTarget::Crop
            )
    )
}

impl<A: AcceleratorService> CodecDevice<A> {
    /// Adjust `format` to something the `direction` queue supports.
    fn adjust_format(
        &self,
        colorimetry: Colorimetry,
        direction: QueueDirection,
        mut format: Format,
    ) -> IoctlResult<(&'static FormatDescriptor, Format)> {
        let descriptor = match self.catalog.find(direction, format.pixel_format) {
            Some(descriptor) => descriptor,
            None => {
                let descriptor = self
                    .catalog
                    .default_format(direction)
                    .ok_or(libc::EINVAL)?;
                debug!(
                    "unsupported {:?} format {}, using {}",
                    direction, format.pixel_format, descriptor.pixel_format
                );
                format.pixel_format = descriptor.pixel_format;
                descriptor
            }
        };

        match direction {
            QueueDirection::Output => {
                if format.colorimetry.colorspace == Colorspace::Default {
                    format.colorimetry.colorspace = colorimetry.colorspace;
                }
            }
            QueueDirection::Capture => format.colorimetry = colorimetry,
        }

        let config = self.role.config();
        format.width = format.width.min(config.max_width);
        format.height = format.height.min(config.max_height);

        if descriptor.compressed {
            format.bytes_per_line = 0;
        } else {
            format.width = format.width.max(MIN_WIDTH);
            format.height = format.height.max(MIN_HEIGHT);
            if self.role.aligns_frame_height() {
                format.height = align_up(format.height, FRAME_HEIGHT_ALIGN);
            }

            let min_stride = stride_for(format.width, format.height, descriptor, self.role);
            format.bytes_per_line = align_up(
                format.bytes_per_line.max(min_stride),
                descriptor.stride_align(self.role),
            );
        }

        let min_size = buffer_size_for(
            format.bytes_per_line,
            format.width,
            format.height,
            descriptor,
        );
        if !descriptor.compressed || format.size_image < min_size {
            format.size_image = min_size;
        }

        format.field = normalize_field(self.role, format.field);

        Ok((descriptor, format))
    }

    pub fn g_fmt<E: ClientEventQueue>(
        &self,
        session: &CodecSession<A, E>,
        direction: QueueDirection,
    ) -> Format {
        session.current_format(direction)
    }

    pub fn try_fmt<E: ClientEventQueue>(
        &self,
        session: &CodecSession<A, E>,
        direction: QueueDirection,
        format: Format,
    ) -> IoctlResult<Format> {
        self.adjust_format(session.colorimetry, direction, format)
            .map(|(_, format)| format)
    }

    pub fn s_fmt<E: ClientEventQueue>(
        &self,
        session: &mut CodecSession<A, E>,
        direction: QueueDirection,
        format: Format,
    ) -> IoctlResult<Format> {
        let requested_height = format.height;
        let (descriptor, format) = self.adjust_format(session.colorimetry, direction, format)?;

        let _guard = self.lock();
        if session.queue(direction).buffers.is_busy() {
            return Err(libc::EBUSY);
        }

        let state = &mut session.queue_mut(direction).state;
        state.format = descriptor;
        state.crop_width = format.width;
        state.height = format.height;
        // A crop chosen by the client or the accelerator survives format changes.
        if !state.crop_explicit || descriptor.compressed {
            state.crop_height = requested_height.min(format.height);
        }
        state.field = format.field;
        state.bytes_per_line = format.bytes_per_line;
        state.size_image = format.size_image;
        session.colorimetry = format.colorimetry;

        debug!(
            "session {}: {:?} format set to {} {}x{} ({} bytes per line, {} bytes)",
            session.id,
            direction,
            format.pixel_format,
            format.width,
            format.height,
            format.bytes_per_line,
            format.size_image
        );

        // Clients of these roles may never set the CAPTURE format, so it follows the coded size.
        let mirror = direction == QueueDirection::Output
            && self.role.aligns_frame_height()
            && descriptor.compressed
            && format.width != 0
            && format.height != 0
            && !session.capture.buffers.is_busy();
        if mirror {
            let capture = &mut session.capture.state;
            capture.crop_width = format.width;
            capture.crop_height = format.height;
            capture.height = align_up(format.height, FRAME_HEIGHT_ALIGN);
            // The column format's stride follows the coded height, not the aligned one.
            capture.bytes_per_line =
                stride_for(format.width, format.height, capture.format, self.role);
            capture.size_image = buffer_size_for(
                capture.bytes_per_line,
                format.width,
                capture.height,
                capture.format,
            );
        }

        if session.component.is_some() {
            session.reconfigure_port(direction)?;
            if mirror {
                session.reconfigure_port(QueueDirection::Capture)?;
            }
        }

        Ok(session.current_format(direction))
    }

    pub fn g_selection<E: ClientEventQueue>(
        &self,
        session: &CodecSession<A, E>,
        direction: QueueDirection,
        target: SelectionTarget,
    ) -> IoctlResult<Rect> {
        use QueueDirection::*;
        use SelectionTarget::*;

        let state = &session.queue(direction).state;
        let crop = Rect::new(0, 0, state.crop_width, state.crop_height);

        match (self.role, direction, target) {
            (Role::Decode, Capture, Compose | ComposeDefault | ComposeBounds) => Ok(crop),
            (Role::Decode, Capture, CropDefault | CropBounds) => {
                Ok(Rect::new(0, 0, buffer_width(state), state.height))
            }
            (Role::Encode | Role::EncodeImage, Output, Crop) => Ok(crop),
            (Role::Encode | Role::EncodeImage, Output, CropDefault | CropBounds) => {
                Ok(Rect::new(0, 0, state.bytes_per_line, state.height))
            }
            (Role::Isp | Role::Deinterlace, Capture, Compose | ComposeDefault | ComposeBounds) => {
                Ok(crop)
            }
            (Role::Isp | Role::Deinterlace, Output, Crop) => Ok(crop),
            (Role::Isp | Role::Deinterlace, Output, CropDefault | CropBounds) => {
                Ok(Rect::new(0, 0, state.bytes_per_line, state.height))
            }
            _ => Err(libc::EINVAL),
        }
    }

    /// Set the crop or compose rectangle. Rectangles are always anchored at the origin, and
    /// clipped to the current buffers.
    pub fn s_selection<E: ClientEventQueue>(
        &self,
        session: &mut CodecSession<A, E>,
        direction: QueueDirection,
        target: SelectionTarget,
        rect: Rect,
    ) -> IoctlResult<Rect> {
        if !is_settable(self.role, direction, target) {
            return Err(libc::EINVAL);
        }

        let _guard = self.lock();
        let role = self.role;
        let state = &mut session.queue_mut(direction).state;
        // Decoders can only shrink the visible area. Other roles accept any rectangle within the
        // crop bounds, so a crop can grow back after being reduced.
        let max_width = if role == Role::Decode {
            state.crop_width
        } else {
            buffer_width(state)
        };
        state.crop_width = rect.width.min(max_width);
        state.crop_height = rect.height.min(state.height);
        state.crop_explicit = true;
        let selection = Rect::new(0, 0, state.crop_width, state.crop_height);

        debug!(
            "session {}: {:?} {:?} set to {}x{}",
            session.id, direction, target, selection.width, selection.height
        );

        session.push_port_format(direction).map_err(|e| {
            error!("session {}: failed to update port format: {}", session.id, e);
            libc::EINVAL
        })?;

        Ok(selection)
    }

    /// Returns the time per frame of the `OUTPUT` queue.
    pub fn g_parm<E: ClientEventQueue>(
        &self,
        session: &CodecSession<A, E>,
        direction: QueueDirection,
    ) -> IoctlResult<Fraction> {
        if !self.role.supports(RoleOps::STREAM_PARAMS) {
            return Err(libc::ENOTTY);
        }
        if direction != QueueDirection::Output {
            return Err(libc::EINVAL);
        }

        Ok(Fraction::new(
            session.frame_rate.denominator,
            session.frame_rate.numerator,
        ))
    }

    /// Set the time per frame of the `OUTPUT` queue.
    pub fn s_parm<E: ClientEventQueue>(
        &self,
        session: &mut CodecSession<A, E>,
        direction: QueueDirection,
        time_per_frame: Fraction,
    ) -> IoctlResult<Fraction> {
        if !self.role.supports(RoleOps::STREAM_PARAMS) {
            return Err(libc::ENOTTY);
        }
        if direction != QueueDirection::Output {
            return Err(libc::EINVAL);
        }
        if time_per_frame.numerator == 0 || time_per_frame.denominator == 0 {
            return Err(libc::EINVAL);
        }

        let _guard = self.lock();
        session.frame_rate = Fraction::new(time_per_frame.denominator, time_per_frame.numerator);
        session
            .push_port_format(QueueDirection::Output)
            .map_err(|e| {
                error!("session {}: failed to update frame rate: {}", session.id, e);
                libc::EINVAL
            })?;

        Ok(time_per_frame)
    }

    pub fn g_pixelaspect<E: ClientEventQueue>(
        &self,
        session: &CodecSession<A, E>,
        direction: QueueDirection,
    ) -> IoctlResult<Fraction> {
        if !self.role.supports(RoleOps::PIXEL_ASPECT) {
            return Err(libc::ENOTTY);
        }
        if direction != QueueDirection::Capture {
            return Err(libc::EINVAL);
        }

        Ok(session.capture.state.aspect_ratio)
    }
}

impl<A: AcceleratorService, E: ClientEventQueue> CodecSession<A, E> {
    /// Format of the port bound to the `direction` queue.
    pub(super) fn port_format(&self, direction: QueueDirection) -> PortFormat {
        let state = &self.queue(direction).state;
        let format = state.format;
        let crop = Rect::new(0, 0, state.crop_width, state.crop_height);

        if !format.compressed {
            let (width, flags) = if format.is_column_format() {
                (
                    state.bytes_per_line,
                    FormatFlags::COL_FMTS_WIDTH_IS_COL_STRIDE,
                )
            } else {
                (buffer_width(state), FormatFlags::empty())
            };

            PortFormat {
                encoding: format.encoding,
                flags,
                bitrate: 0,
                width,
                height: state.height,
                crop,
                frame_rate: self.frame_rate,
            }
        } else if self.role == Role::Decode {
            // The decoder finds the geometry in the stream.
            PortFormat {
                encoding: format.encoding,
                ..Default::default()
            }
        } else {
            PortFormat {
                encoding: format.encoding,
                flags: FormatFlags::empty(),
                bitrate: self.controls.bitrate,
                width: state.crop_width,
                height: state.height,
                crop,
                frame_rate: self.frame_rate,
            }
        }
    }

    /// Send the format of the `direction` queue to its port, if the component exists.
    pub(super) fn push_port_format(&mut self, direction: QueueDirection) -> Result<(), AccelError> {
        let format = self.port_format(direction);
        let size = self.queue(direction).state.size_image;
        let port_id = PortId::from(direction);
        let Some(component) = self.component.as_mut() else {
            return Ok(());
        };

        let port = component.port_mut(port_id);
        port.format = format;
        port.current_buffer.size = size;
        component.set_port_format(port_id)?;

        let port = component.port(port_id);
        if port.current_buffer.size < port.minimum_buffer.size {
            warn!(
                "session {}: {:?} buffers of {} bytes are smaller than the {} bytes required by the port",
                self.id, direction, port.current_buffer.size, port.minimum_buffer.size
            );
        }

        Ok(())
    }

    /// Apply a new format of the `direction` queue to its port, disabling the port during the
    /// change if needed.
    pub(super) fn reconfigure_port(&mut self, direction: QueueDirection) -> IoctlResult<()> {
        let port_id = PortId::from(direction);
        let Some(component) = self.component.as_mut() else {
            return Ok(());
        };

        let was_enabled = component.port(port_id).enabled;
        if was_enabled {
            let in_flight = component.port(port_id).buffers_in_flight();
            if in_flight > 0 {
                warn!(
                    "session {}: reconfiguring {:?} port with {} buffers in flight",
                    self.id, port_id, in_flight
                );
            }

            // Disabling the port resets its buffer count.
            let num = component.port(port_id).current_buffer.num;
            if let Err(e) = component.disable_port(port_id) {
                error!(
                    "session {}: failed to disable {:?} port: {}",
                    self.id, port_id, e
                );
            }
            component.port_mut(port_id).current_buffer.num = num;
            self.process_messages();
        }

        self.push_port_format(direction).map_err(|e| {
            error!(
                "session {}: failed to set {:?} port format: {}",
                self.id, port_id, e
            );
            libc::EINVAL
        })?;

        if was_enabled {
            let sender = self.message_sender.clone();
            if let Some(component) = self.component.as_mut() {
                component.enable_port(port_id, sender).map_err(|e| {
                    error!(
                        "session {}: failed to re-enable {:?} port: {}",
                        self.id, port_id, e
                    );
                    e.errno()
                })?;
            }
        }

        Ok(())
    }
}
