// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client-side (V4L2) values exchanged with transform sessions.
//!
//! Numeric values follow the V4L2 UAPI so they can be forwarded to and from a V4L2 front-end
//! without translation.

use std::fmt;

use bitflags::bitflags;
use enumn::N;

/// Packs a four-character code into its `u32` representation.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// A V4L2 pixel format, identified by its fourcc.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const fn from_fourcc(code: &[u8; 4]) -> Self {
        Self(fourcc(code))
    }

    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const YUV420: Self = Self::from_fourcc(b"YU12");
    pub const YVU420: Self = Self::from_fourcc(b"YV12");
    pub const NV12: Self = Self::from_fourcc(b"NV12");
    pub const NV21: Self = Self::from_fourcc(b"NV21");
    pub const RGB565: Self = Self::from_fourcc(b"RGBP");
    pub const YUYV: Self = Self::from_fourcc(b"YUYV");
    pub const UYVY: Self = Self::from_fourcc(b"UYVY");
    pub const YVYU: Self = Self::from_fourcc(b"YVYU");
    pub const VYUY: Self = Self::from_fourcc(b"VYUY");
    /// NV12 stored in 128 bytes wide columns.
    pub const NV12_COL128: Self = Self::from_fourcc(b"NC12");
    pub const RGB24: Self = Self::from_fourcc(b"RGB3");
    pub const BGR24: Self = Self::from_fourcc(b"BGR3");
    pub const BGR32: Self = Self::from_fourcc(b"BGR4");
    pub const RGBA32: Self = Self::from_fourcc(b"AB24");

    pub const SBGGR8: Self = Self::from_fourcc(b"BA81");
    pub const SGBRG8: Self = Self::from_fourcc(b"GBRG");
    pub const SGRBG8: Self = Self::from_fourcc(b"GRBG");
    pub const SRGGB8: Self = Self::from_fourcc(b"RGGB");
    pub const SBGGR10P: Self = Self::from_fourcc(b"pBAA");
    pub const SGBRG10P: Self = Self::from_fourcc(b"pGAA");
    pub const SGRBG10P: Self = Self::from_fourcc(b"pgAA");
    pub const SRGGB10P: Self = Self::from_fourcc(b"pRAA");
    pub const SBGGR12P: Self = Self::from_fourcc(b"pBCC");
    pub const SGBRG12P: Self = Self::from_fourcc(b"pGCC");
    pub const SGRBG12P: Self = Self::from_fourcc(b"pgCC");
    pub const SRGGB12P: Self = Self::from_fourcc(b"pRCC");
    pub const SBGGR14P: Self = Self::from_fourcc(b"pBEE");
    pub const SGBRG14P: Self = Self::from_fourcc(b"pGEE");
    pub const SGRBG14P: Self = Self::from_fourcc(b"pgEE");
    pub const SRGGB14P: Self = Self::from_fourcc(b"pREE");
    pub const SBGGR16: Self = Self::from_fourcc(b"BYR2");
    pub const SGBRG16: Self = Self::from_fourcc(b"GB16");
    pub const SGRBG16: Self = Self::from_fourcc(b"GR16");
    pub const SRGGB16: Self = Self::from_fourcc(b"RG16");
    pub const SBGGR10: Self = Self::from_fourcc(b"BG10");
    pub const SGBRG10: Self = Self::from_fourcc(b"GB10");
    pub const SGRBG10: Self = Self::from_fourcc(b"BA10");
    pub const SRGGB10: Self = Self::from_fourcc(b"RG10");
    pub const SBGGR12: Self = Self::from_fourcc(b"BG12");
    pub const SGBRG12: Self = Self::from_fourcc(b"GB12");
    pub const SGRBG12: Self = Self::from_fourcc(b"BA12");
    pub const SRGGB12: Self = Self::from_fourcc(b"RG12");
    pub const SBGGR14: Self = Self::from_fourcc(b"BG14");
    pub const SGBRG14: Self = Self::from_fourcc(b"GB14");
    pub const SGRBG14: Self = Self::from_fourcc(b"GR14");
    pub const SRGGB14: Self = Self::from_fourcc(b"RG14");

    pub const GREY: Self = Self::from_fourcc(b"GREY");
    pub const Y10P: Self = Self::from_fourcc(b"Y10P");
    pub const Y12P: Self = Self::from_fourcc(b"Y12P");
    pub const Y14P: Self = Self::from_fourcc(b"Y14P");
    pub const Y16: Self = Self::from_fourcc(b"Y16 ");
    pub const Y10: Self = Self::from_fourcc(b"Y10 ");
    pub const Y12: Self = Self::from_fourcc(b"Y12 ");
    pub const Y14: Self = Self::from_fourcc(b"Y14 ");

    pub const H264: Self = Self::from_fourcc(b"H264");
    pub const JPEG: Self = Self::from_fourcc(b"JPEG");
    pub const MJPEG: Self = Self::from_fourcc(b"MJPG");
    pub const MPEG4: Self = Self::from_fourcc(b"MPG4");
    pub const H263: Self = Self::from_fourcc(b"H263");
    pub const MPEG2: Self = Self::from_fourcc(b"MPG2");
    pub const VC1_ANNEX_G: Self = Self::from_fourcc(b"VC1G");
}

impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code: String = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&c| {
                if c.is_ascii_graphic() || c == b' ' {
                    c as char
                } else {
                    '.'
                }
            })
            .collect();
        write!(f, "{}", code)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Direction of a queue, from the point of view of the client.
///
/// `Output` buffers carry source data towards the accelerator's input port, `Capture` buffers
/// receive the accelerator's output port data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueDirection {
    Output,
    Capture,
}

impl QueueDirection {
    pub fn opposite(self) -> Self {
        match self {
            QueueDirection::Output => QueueDirection::Capture,
            QueueDirection::Capture => QueueDirection::Output,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N, Default)]
#[repr(u32)]
pub enum Field {
    #[default]
    Any = 0,
    None = 1,
    Top = 2,
    Bottom = 3,
    Interlaced = 4,
    SeqTb = 5,
    SeqBt = 6,
    Alternate = 7,
    InterlacedTb = 8,
    InterlacedBt = 9,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N, Default)]
#[repr(u32)]
pub enum Colorspace {
    #[default]
    Default = 0,
    Smpte170m = 1,
    Smpte240m = 2,
    Rec709 = 3,
    Bt878 = 4,
    SysM470 = 5,
    SysBg470 = 6,
    Jpeg = 7,
    Srgb = 8,
    OpRgb = 9,
    Bt2020 = 10,
    Raw = 11,
    DciP3 = 12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N, Default)]
#[repr(u32)]
pub enum XferFunc {
    #[default]
    Default = 0,
    F709 = 1,
    Srgb = 2,
    OpRgb = 3,
    Smpte240m = 4,
    None = 5,
    DciP3 = 6,
    Smpte2084 = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N, Default)]
#[repr(u32)]
pub enum YCbCrEncoding {
    #[default]
    Default = 0,
    E601 = 1,
    E709 = 2,
    Xv601 = 3,
    Xv709 = 4,
    Sycc = 5,
    Bt2020 = 6,
    Bt2020ConstLum = 7,
    Smpte240m = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N, Default)]
#[repr(u32)]
pub enum Quantization {
    #[default]
    Default = 0,
    FullRange = 1,
    LimRange = 2,
}

impl Colorspace {
    /// Transfer function V4L2 implies for this colorspace.
    pub fn default_xfer_func(self) -> XferFunc {
        match self {
            Colorspace::OpRgb => XferFunc::OpRgb,
            Colorspace::Smpte240m => XferFunc::Smpte240m,
            Colorspace::DciP3 => XferFunc::DciP3,
            Colorspace::Raw => XferFunc::None,
            Colorspace::Srgb | Colorspace::Jpeg => XferFunc::Srgb,
            _ => XferFunc::F709,
        }
    }

    /// Y'CbCr encoding V4L2 implies for this colorspace.
    pub fn default_ycbcr_enc(self) -> YCbCrEncoding {
        match self {
            Colorspace::Rec709 | Colorspace::DciP3 => YCbCrEncoding::E709,
            Colorspace::Bt2020 => YCbCrEncoding::Bt2020,
            Colorspace::Smpte240m => YCbCrEncoding::Smpte240m,
            _ => YCbCrEncoding::E601,
        }
    }

    /// Quantization V4L2 implies for this colorspace.
    pub fn default_quantization(self, is_rgb: bool, ycbcr_enc: YCbCrEncoding) -> Quantization {
        if is_rgb && self == Colorspace::Bt2020 {
            Quantization::LimRange
        } else if is_rgb
            || matches!(ycbcr_enc, YCbCrEncoding::Xv601 | YCbCrEncoding::Xv709)
            || self == Colorspace::Jpeg
        {
            Quantization::FullRange
        } else {
            Quantization::LimRange
        }
    }
}

/// Colorimetry of a session, shared by both queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colorimetry {
    pub colorspace: Colorspace,
    pub xfer_func: XferFunc,
    pub ycbcr_enc: YCbCrEncoding,
    pub quantization: Quantization,
}

impl Default for Colorimetry {
    fn default() -> Self {
        Self {
            colorspace: Colorspace::Rec709,
            xfer_func: XferFunc::Default,
            ycbcr_enc: YCbCrEncoding::Default,
            quantization: Quantization::Default,
        }
    }
}

impl Colorimetry {
    /// Colorimetry with every field derived from `colorspace`.
    pub fn from_colorspace(colorspace: Colorspace) -> Self {
        let ycbcr_enc = colorspace.default_ycbcr_enc();
        Self {
            colorspace,
            xfer_func: colorspace.default_xfer_func(),
            ycbcr_enc,
            quantization: colorspace
                .default_quantization(colorspace == Colorspace::Srgb, ycbcr_enc),
        }
    }
}

/// Single-planar format of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub field: Field,
    pub bytes_per_line: u32,
    pub size_image: u32,
    pub colorimetry: Colorimetry,
}

impl Format {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
            field: Field::Any,
            bytes_per_line: 0,
            size_image: 0,
            colorimetry: Colorimetry {
                colorspace: Colorspace::Default,
                xfer_func: XferFunc::Default,
                ycbcr_enc: YCbCrEncoding::Default,
                quantization: Quantization::Default,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fraction {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum SelectionTarget {
    Crop = 0x0000,
    CropDefault = 0x0001,
    CropBounds = 0x0002,
    NativeSize = 0x0003,
    Compose = 0x0100,
    ComposeDefault = 0x0101,
    ComposeBounds = 0x0102,
    ComposePadded = 0x0103,
}

bitflags! {
    /// Subset of the V4L2 buffer flags relevant to transform sessions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        const KEYFRAME = 0x0000_0008;
        const ERROR = 0x0000_0040;
        const TIMESTAMP_COPY = 0x0000_4000;
        const LAST = 0x0010_0000;
    }
}

/// Events a client can subscribe to and receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The last buffer of the stream has been produced.
    EndOfStream,
    /// The accelerator changed the geometry of the produced frames.
    ResolutionChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderCmd {
    Start,
    Stop { to_black: bool },
    Pause,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderCmd {
    Start,
    Stop,
    Pause,
    Resume,
}

/// Step-wise range of frame sizes supported for a pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSizeStepwise {
    pub min_width: u32,
    pub max_width: u32,
    pub step_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub step_height: u32,
}

#[cfg(test)]
mod tests {
    use super::Colorimetry;
    use super::Colorspace;
    use super::PixelFormat;
    use super::Quantization;
    use super::XferFunc;
    use super::YCbCrEncoding;

    #[test]
    fn pixel_format_debug() {
        assert_eq!(format!("{:?}", PixelFormat::NV12), "NV12");
        assert_eq!(format!("{}", PixelFormat::Y16), "Y16 ");
        assert_eq!(PixelFormat::H264.to_u32(), 0x3436_3248);
    }

    #[test]
    fn colorimetry_defaults() {
        let srgb = Colorimetry::from_colorspace(Colorspace::Srgb);
        assert_eq!(srgb.xfer_func, XferFunc::Srgb);
        assert_eq!(srgb.ycbcr_enc, YCbCrEncoding::E601);
        assert_eq!(srgb.quantization, Quantization::FullRange);

        let rec709 = Colorimetry::from_colorspace(Colorspace::Rec709);
        assert_eq!(rec709.xfer_func, XferFunc::F709);
        assert_eq!(rec709.ycbcr_enc, YCbCrEncoding::E709);
        assert_eq!(rec709.quantization, Quantization::LimRange);
    }
}
