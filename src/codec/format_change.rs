// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;
use log::error;
use log::warn;
use zerocopy::FromBytes;

use crate::accel::color_space;
use crate::accel::encoding;
use crate::accel::params::FormatChangedEvent;
use crate::accel::params::InterlaceMode;
use crate::accel::params::InterlaceTypeParam;
use crate::accel::AcceleratorComponent;
use crate::accel::AcceleratorService;
use crate::accel::EsType;
use crate::accel::ParameterId;
use crate::accel::PortId;
use crate::geometry::stride_for;
use crate::protocol::ClientEvent;
use crate::protocol::Colorimetry;
use crate::protocol::Colorspace;
use crate::protocol::Field;
use crate::protocol::Fraction;
use crate::ClientEventQueue;

use super::CodecSession;

impl<A: AcceleratorService, E: ClientEventQueue> CodecSession<A, E> {
    /// Adopt the new geometry of the produced frames announced by the accelerator.
    pub(super) fn format_changed(&mut self, payload: &[u8]) {
        let Some(event) = FormatChangedEvent::read_from_prefix(payload) else {
            warn!(
                "session {}: format change event too short ({} bytes)",
                self.id,
                payload.len()
            );
            return;
        };
        if EsType::n(event.es_type) != Some(EsType::Video) {
            debug!(
                "session {}: ignoring format change of stream type {}",
                self.id, event.es_type
            );
            return;
        }

        debug!(
            "session {}: accelerator format changed to {}x{} (crop {}x{}, {} bytes)",
            self.id,
            event.width,
            event.height,
            event.crop.width,
            event.crop.height,
            event.buffer_size_min
        );

        let role = self.role;
        let state = &mut self.capture.state;
        state.crop_width = u32::try_from(event.crop.width).unwrap_or(0);
        state.crop_height = u32::try_from(event.crop.height).unwrap_or(0);
        // Client format requests must not override the crop of the stream.
        state.crop_explicit = true;
        state.bytes_per_line = stride_for(event.width, event.height, state.format, role);
        state.height = event.height;
        state.size_image = event.buffer_size_min;
        if event.par.numerator > 0 && event.par.denominator > 0 {
            state.aspect_ratio =
                Fraction::new(event.par.numerator as u32, event.par.denominator as u32);
        }

        if event.color_space != color_space::UNKNOWN {
            let colorspace = if encoding::is_yuv(event.encoding) {
                match event.color_space {
                    color_space::ITUR_BT601 => Colorspace::Smpte170m,
                    color_space::ITUR_BT709 => Colorspace::Rec709,
                    _ => self.colorimetry.colorspace,
                }
            } else {
                Colorspace::Srgb
            };
            self.colorimetry = Colorimetry::from_colorspace(colorspace);
        }

        self.capture.state.field = self.output_interlacing();

        if self.capture.buffers.is_streaming() {
            // Make the client stop dequeueing until it has seen the change.
            self.capture.buffers.set_last_buffer_dequeued(true);
        }

        self.send_event(ClientEvent::ResolutionChanged);
    }

    /// Field of the frames currently produced by the output port.
    fn output_interlacing(&mut self) -> Field {
        let Some(component) = self.component.as_mut() else {
            return Field::None;
        };

        match component
            .get_param::<InterlaceTypeParam>(PortId::Output, ParameterId::VideoInterlaceType)
        {
            Ok(param) => match InterlaceMode::n(param.mode) {
                Some(InterlaceMode::FieldsInterleavedUpperFirst) => Field::InterlacedTb,
                Some(InterlaceMode::FieldsInterleavedLowerFirst) => Field::InterlacedBt,
                _ => Field::None,
            },
            Err(e) => {
                error!(
                    "session {}: failed to read interlace type: {}",
                    self.id, e
                );
                Field::None
            }
        }
    }
}
