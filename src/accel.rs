// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the remote accelerator service.
//!
//! The accelerator is reached through an opaque asynchronous channel. This module only describes
//! what the transform sessions need from it: components with one input and one output port, typed
//! port parameters, and buffer headers travelling back and forth. Buffers returned by the
//! accelerator, as well as the events it emits, are delivered as [`PortMessage`]s over the
//! [`std::sync::mpsc::Sender`] given when enabling a port. Implementors of
//! [`AcceleratorService`] provide the actual transport.

pub mod params;

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use bitflags::bitflags;
use enumn::N;
use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::protocol::fourcc;
use crate::protocol::Fraction;
use crate::protocol::QueueDirection;
use crate::protocol::Rect;

pub use params::ParameterId;

/// Encoding identifiers understood by the accelerator.
pub mod encoding {
    use crate::protocol::fourcc;

    pub const H264: u32 = fourcc(b"H264");
    pub const MP4V: u32 = fourcc(b"MP4V");
    pub const H263: u32 = fourcc(b"H263");
    pub const MP2V: u32 = fourcc(b"MP2V");
    pub const WVC1: u32 = fourcc(b"WVC1");
    pub const JPEG: u32 = fourcc(b"JPEG");
    pub const MJPEG: u32 = fourcc(b"MJPG");

    pub const I420: u32 = fourcc(b"I420");
    pub const YV12: u32 = fourcc(b"YV12");
    pub const NV12: u32 = fourcc(b"NV12");
    pub const NV21: u32 = fourcc(b"NV21");
    pub const YUYV: u32 = fourcc(b"YUYV");
    pub const YVYU: u32 = fourcc(b"YVYU");
    pub const UYVY: u32 = fourcc(b"UYVY");
    pub const VYUY: u32 = fourcc(b"VYUY");
    /// NV12 in 128 bytes wide columns.
    pub const YUVUV128: u32 = fourcc(b"SAND");
    pub const RGB16: u32 = fourcc(b"RGB2");
    pub const RGB24: u32 = fourcc(b"RGB3");
    pub const BGR24: u32 = fourcc(b"BGR3");
    pub const RGBA: u32 = fourcc(b"RGBA");
    pub const BGRA: u32 = fourcc(b"BGRA");

    pub const BAYER_SBGGR8: u32 = fourcc(b"BA81");
    pub const BAYER_SGBRG8: u32 = fourcc(b"GBRG");
    pub const BAYER_SGRBG8: u32 = fourcc(b"GRBG");
    pub const BAYER_SRGGB8: u32 = fourcc(b"RGGB");
    pub const BAYER_SBGGR10P: u32 = fourcc(b"pBAA");
    pub const BAYER_SGBRG10P: u32 = fourcc(b"pGAA");
    pub const BAYER_SGRBG10P: u32 = fourcc(b"pgAA");
    pub const BAYER_SRGGB10P: u32 = fourcc(b"pRAA");
    pub const BAYER_SBGGR12P: u32 = fourcc(b"pBCC");
    pub const BAYER_SGBRG12P: u32 = fourcc(b"pGCC");
    pub const BAYER_SGRBG12P: u32 = fourcc(b"pgCC");
    pub const BAYER_SRGGB12P: u32 = fourcc(b"pRCC");
    pub const BAYER_SBGGR14P: u32 = fourcc(b"pBEE");
    pub const BAYER_SGBRG14P: u32 = fourcc(b"pGEE");
    pub const BAYER_SGRBG14P: u32 = fourcc(b"pgEE");
    pub const BAYER_SRGGB14P: u32 = fourcc(b"pREE");
    pub const BAYER_SBGGR16: u32 = fourcc(b"BG16");
    pub const BAYER_SGBRG16: u32 = fourcc(b"GB16");
    pub const BAYER_SGRBG16: u32 = fourcc(b"GR16");
    pub const BAYER_SRGGB16: u32 = fourcc(b"RG16");
    pub const BAYER_SBGGR10: u32 = fourcc(b"BG10");
    pub const BAYER_SGBRG10: u32 = fourcc(b"GB10");
    pub const BAYER_SGRBG10: u32 = fourcc(b"BA10");
    pub const BAYER_SRGGB10: u32 = fourcc(b"RG10");
    pub const BAYER_SBGGR12: u32 = fourcc(b"BG12");
    pub const BAYER_SGBRG12: u32 = fourcc(b"GB12");
    pub const BAYER_SGRBG12: u32 = fourcc(b"BA12");
    pub const BAYER_SRGGB12: u32 = fourcc(b"RG12");
    pub const BAYER_SBGGR14: u32 = fourcc(b"BG14");
    pub const BAYER_SGBRG14: u32 = fourcc(b"GB14");
    pub const BAYER_SGRBG14: u32 = fourcc(b"GR14");
    pub const BAYER_SRGGB14: u32 = fourcc(b"RG14");

    pub const GREY: u32 = fourcc(b"GREY");
    pub const Y10P: u32 = fourcc(b"Y10P");
    pub const Y12P: u32 = fourcc(b"Y12P");
    pub const Y14P: u32 = fourcc(b"Y14P");
    pub const Y16: u32 = fourcc(b"Y16 ");
    pub const Y10: u32 = fourcc(b"Y10 ");
    pub const Y12: u32 = fourcc(b"Y12 ");
    pub const Y14: u32 = fourcc(b"Y14 ");

    /// Encodings whose colour space is described in YUV terms.
    pub fn is_yuv(encoding: u32) -> bool {
        matches!(
            encoding,
            I420 | YV12 | NV12 | NV21 | YUYV | YVYU | UYVY | VYUY
        )
    }
}

/// Colour spaces reported by the accelerator.
pub mod color_space {
    use crate::protocol::fourcc;

    pub const UNKNOWN: u32 = 0;
    pub const ITUR_BT601: u32 = fourcc(b"Y601");
    pub const ITUR_BT709: u32 = fourcc(b"Y709");
    pub const JPEG_JFIF: u32 = fourcc(b"YJFI");
}

/// Command of a [`PortMessage::Event`] signalling a change of the output format.
pub const EVENT_FORMAT_CHANGED: u32 = fourcc(b"EFCH");
pub const EVENT_EOS: u32 = fourcc(b"EEOS");
pub const EVENT_ERROR: u32 = fourcc(b"ERRO");

/// Value of a timestamp that is not known.
pub const TIME_UNKNOWN: i64 = i64::MIN;

/// Errors returned by the accelerator service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccelError {
    #[error("component {0} cannot be created")]
    NoSuchComponent(String),
    #[error("operation requires an enabled port")]
    PortDisabled,
    #[error("parameter {0:?} rejected by the accelerator")]
    ParameterRejected(ParameterId),
    #[error("parameter blob of unexpected size ({0} bytes)")]
    InvalidParameterSize(usize),
    #[error("accelerator transport failure: {0}")]
    Transport(i32),
}

impl AccelError {
    /// errno to report to the client when this error makes its request fail.
    pub fn errno(&self) -> i32 {
        match self {
            AccelError::NoSuchComponent(_) => libc::ENOMEM,
            AccelError::PortDisabled
            | AccelError::ParameterRejected(_)
            | AccelError::InvalidParameterSize(_) => libc::EINVAL,
            AccelError::Transport(errno) => *errno,
        }
    }
}

/// Ports of an accelerator component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortId {
    /// Port of the component itself, only used for parameters.
    Control,
    /// Port consuming the client's `OUTPUT` buffers.
    Input,
    /// Port producing into the client's `CAPTURE` buffers.
    Output,
}

impl From<QueueDirection> for PortId {
    fn from(direction: QueueDirection) -> Self {
        match direction {
            QueueDirection::Output => PortId::Input,
            QueueDirection::Capture => PortId::Output,
        }
    }
}

/// Elementary stream type of a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum EsType {
    Unknown = 0,
    Control = 1,
    Audio = 2,
    Video = 3,
    Subpicture = 4,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FormatFlags: u32 {
        /// The width of a column format is its column stride, in lines.
        const COL_FMTS_WIDTH_IS_COL_STRIDE = 1 << 1;
    }
}

/// Format of the data flowing through a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortFormat {
    pub encoding: u32,
    pub flags: FormatFlags,
    pub bitrate: u32,
    pub width: u32,
    pub height: u32,
    pub crop: Rect,
    pub frame_rate: Fraction,
}

impl Default for PortFormat {
    fn default() -> Self {
        Self {
            encoding: 0,
            flags: FormatFlags::empty(),
            bitrate: 0,
            width: 0,
            height: 0,
            crop: Rect::default(),
            frame_rate: Fraction::new(0, 1),
        }
    }
}

/// Number and size of the buffers exchanged over a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferRequirements {
    pub num: u32,
    pub size: u32,
}

/// Count of buffers currently held by the accelerator on a port.
///
/// Shared between the port and whatever context delivers the returned buffers, so it can be
/// checked without locking.
#[derive(Debug, Clone, Default)]
pub struct InFlightCounter(Arc<AtomicU32>);

impl InFlightCounter {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the counter, never going below zero.
    pub fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }
}

/// Accelerator-side endpoint of a queue.
///
/// Owned by the component. Sessions configure `format` and `current_buffer` before calling
/// [`AcceleratorComponent::set_port_format`], and read the rest.
#[derive(Debug, Clone, Default)]
pub struct Port {
    pub format: PortFormat,
    pub current_buffer: BufferRequirements,
    pub minimum_buffer: BufferRequirements,
    pub recommended_buffer: BufferRequirements,
    pub enabled: bool,
    pub in_flight: InFlightCounter,
}

impl Port {
    pub fn new(minimum_buffer: BufferRequirements) -> Self {
        Self {
            minimum_buffer,
            recommended_buffer: minimum_buffer,
            current_buffer: minimum_buffer,
            ..Default::default()
        }
    }

    pub fn buffers_in_flight(&self) -> u32 {
        self.in_flight.get()
    }
}

bitflags! {
    /// Flags of a [`BufferHeader`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u32 {
        const EOS = 1 << 0;
        const FRAME_START = 1 << 1;
        const FRAME_END = 1 << 2;
        const FRAME = Self::FRAME_START.bits() | Self::FRAME_END.bits();
        const KEYFRAME = 1 << 3;
        const DISCONTINUITY = 1 << 4;
        const CONFIG = 1 << 5;
        const CORRUPTED = 1 << 9;
        const INTERLACED = 1 << 16;
        const TOP_FIELD_FIRST = 1 << 17;
    }
}

/// Which buffer a [`BufferHeader`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTag {
    /// Client buffer at this index of the queue bound to the port.
    Slot(u32),
    /// Reserved end-of-stream buffer of the input port.
    Eos,
}

/// Accelerator view of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHeader {
    pub tag: BufferTag,
    pub flags: HeaderFlags,
    /// Number of valid bytes.
    pub length: u32,
    pub alloc_size: u32,
    /// Presentation timestamp, in microseconds.
    pub pts: i64,
    /// Decode timestamp, in microseconds.
    pub dts: i64,
    /// Handle to the shared memory backing the buffer, if the client imported one.
    pub dma_handle: Option<u64>,
}

impl BufferHeader {
    pub fn new(tag: BufferTag, alloc_size: u32) -> Self {
        Self {
            tag,
            flags: HeaderFlags::empty(),
            length: 0,
            alloc_size,
            pts: TIME_UNKNOWN,
            dts: TIME_UNKNOWN,
            dma_handle: None,
        }
    }
}

/// Messages sent by the accelerator to the owner of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMessage {
    /// A buffer previously submitted to `port` has been returned.
    BufferDone {
        port: PortId,
        status: Result<(), AccelError>,
        header: BufferHeader,
    },
    /// The accelerator emitted an event on `port` instead of returning a data buffer.
    Event {
        port: PortId,
        cmd: u32,
        payload: Vec<u8>,
    },
}

/// A component instantiated by the accelerator service.
pub trait AcceleratorComponent {
    fn port(&self, port: PortId) -> &Port;
    fn port_mut(&mut self, port: PortId) -> &mut Port;

    fn is_enabled(&self) -> bool;
    fn enable(&mut self) -> Result<(), AccelError>;
    fn disable(&mut self) -> Result<(), AccelError>;

    /// Push the `format` and `current_buffer` of `port` to the accelerator. The accelerator may
    /// update `minimum_buffer` and `recommended_buffer` as a result.
    fn set_port_format(&mut self, port: PortId) -> Result<(), AccelError>;

    /// Read parameter `id` of `port` into `value`, returning the number of bytes written.
    fn get_parameter(
        &mut self,
        port: PortId,
        id: ParameterId,
        value: &mut [u8],
    ) -> Result<usize, AccelError>;
    fn set_parameter(&mut self, port: PortId, id: ParameterId, value: &[u8])
        -> Result<(), AccelError>;

    /// Enable `port`. Buffers returned from now on and events are sent to `messages`.
    fn enable_port(
        &mut self,
        port: PortId,
        messages: Sender<PortMessage>,
    ) -> Result<(), AccelError>;
    /// Disable `port`. All the buffers held by the accelerator on this port are sent back before
    /// this method returns.
    fn disable_port(&mut self, port: PortId) -> Result<(), AccelError>;

    fn submit_buffer(&mut self, port: PortId, header: BufferHeader) -> Result<(), AccelError>;

    /// Typed version of [`AcceleratorComponent::set_parameter`].
    fn set_param<T: AsBytes>(
        &mut self,
        port: PortId,
        id: ParameterId,
        value: &T,
    ) -> Result<(), AccelError> {
        self.set_parameter(port, id, value.as_bytes())
    }

    /// Typed version of [`AcceleratorComponent::get_parameter`].
    fn get_param<T: AsBytes + FromBytes>(
        &mut self,
        port: PortId,
        id: ParameterId,
    ) -> Result<T, AccelError> {
        let mut value = T::new_zeroed();
        let len = self.get_parameter(port, id, value.as_bytes_mut())?;
        if len < std::mem::size_of::<T>() {
            return Err(AccelError::InvalidParameterSize(len));
        }

        Ok(value)
    }
}

/// Connection to the accelerator service, shared by all the sessions of a device instance.
pub trait AcceleratorService {
    type Component: AcceleratorComponent;

    /// Instantiate component `name`.
    fn create_component(&mut self, name: &str) -> Result<Self::Component, AccelError>;
    fn destroy_component(&mut self, component: Self::Component);

    /// Encodings supported by `port` of `component`.
    fn supported_encodings(
        &mut self,
        component: &mut Self::Component,
        port: PortId,
    ) -> Result<Vec<u32>, AccelError>;
}

#[cfg(test)]
mod tests {
    use super::InFlightCounter;

    #[test]
    fn in_flight_counter_saturates() {
        let counter = InFlightCounter::default();
        let shared = counter.clone();
        counter.increment();
        counter.increment();
        assert_eq!(shared.get(), 2);
        shared.decrement();
        shared.decrement();
        shared.decrement();
        assert_eq!(counter.get(), 0);
    }
}
