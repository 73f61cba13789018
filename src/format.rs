// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pixel formats supported by the accelerator, and the per-device catalog built from them.

use crate::accel::encoding;
use crate::protocol::PixelFormat;
use crate::protocol::QueueDirection;
use crate::role::Role;

/// Maximum number of encodings considered per port when building a catalog.
pub const MAX_SUPPORTED_ENCODINGS: usize = 70;

/// Bytes-per-line alignment of a format, for each role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrideAlign {
    pub decode: u32,
    pub encode: u32,
    pub isp: u32,
    pub deinterlace: u32,
    pub encode_image: u32,
}

impl StrideAlign {
    pub const fn uniform(align: u32) -> Self {
        Self {
            decode: align,
            encode: align,
            isp: align,
            deinterlace: align,
            encode_image: align,
        }
    }

    pub fn for_role(&self, role: Role) -> u32 {
        match role {
            Role::Decode => self.decode,
            Role::Encode => self.encode,
            Role::Isp => self.isp,
            Role::Deinterlace => self.deinterlace,
            Role::EncodeImage => self.encode_image,
        }
    }
}

/// Planar 4:2:0 formats need a wider alignment on the encoder and ISP, so their chroma planes stay
/// 32 bytes aligned.
const PLANAR_YUV_ALIGN: StrideAlign = StrideAlign {
    decode: 32,
    encode: 64,
    isp: 64,
    deinterlace: 32,
    encode_image: 32,
};

/// Geometry rules and accelerator encoding of a pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub pixel_format: PixelFormat,
    /// Bits per pixel of the first plane. Zero for compressed formats.
    pub depth: u32,
    pub stride_align: StrideAlign,
    pub compressed: bool,
    /// Encoding identifier used by the accelerator.
    pub encoding: u32,
    /// Twice the ratio between the whole frame size and the size of its first plane.
    pub size_multiplier_x2: u32,
    pub bayer: bool,
}

impl FormatDescriptor {
    const fn raw(
        pixel_format: PixelFormat,
        depth: u32,
        stride_align: StrideAlign,
        encoding: u32,
        size_multiplier_x2: u32,
    ) -> Self {
        Self {
            pixel_format,
            depth,
            stride_align,
            compressed: false,
            encoding,
            size_multiplier_x2,
            bayer: false,
        }
    }

    const fn bayer(pixel_format: PixelFormat, depth: u32, encoding: u32) -> Self {
        Self {
            pixel_format,
            depth,
            stride_align: StrideAlign::uniform(32),
            compressed: false,
            encoding,
            size_multiplier_x2: 2,
            bayer: true,
        }
    }

    const fn compressed(pixel_format: PixelFormat, encoding: u32) -> Self {
        Self {
            pixel_format,
            depth: 0,
            stride_align: StrideAlign::uniform(0),
            compressed: true,
            encoding,
            size_multiplier_x2: 0,
            bayer: false,
        }
    }

    pub fn stride_align(&self, role: Role) -> u32 {
        self.stride_align.for_role(role)
    }

    /// Whether this is the format storing its frames in 128 bytes wide columns.
    pub fn is_column_format(&self) -> bool {
        self.pixel_format == PixelFormat::NV12_COL128
    }
}

const ALIGN_32: StrideAlign = StrideAlign::uniform(32);

/// Every format the bridge knows about, in order of preference.
pub static SUPPORTED_FORMATS: &[FormatDescriptor] = &[
    // YUV formats
    FormatDescriptor::raw(PixelFormat::YUV420, 8, PLANAR_YUV_ALIGN, encoding::I420, 3),
    FormatDescriptor::raw(PixelFormat::YVU420, 8, PLANAR_YUV_ALIGN, encoding::YV12, 3),
    FormatDescriptor::raw(PixelFormat::NV12, 8, ALIGN_32, encoding::NV12, 3),
    FormatDescriptor::raw(PixelFormat::NV21, 8, ALIGN_32, encoding::NV21, 3),
    FormatDescriptor::raw(PixelFormat::RGB565, 16, ALIGN_32, encoding::RGB16, 2),
    FormatDescriptor::raw(PixelFormat::YUYV, 16, ALIGN_32, encoding::YUYV, 2),
    FormatDescriptor::raw(PixelFormat::UYVY, 16, ALIGN_32, encoding::UYVY, 2),
    FormatDescriptor::raw(PixelFormat::YVYU, 16, ALIGN_32, encoding::YVYU, 2),
    FormatDescriptor::raw(PixelFormat::VYUY, 16, ALIGN_32, encoding::VYUY, 2),
    FormatDescriptor::raw(PixelFormat::NV12_COL128, 8, ALIGN_32, encoding::YUVUV128, 3),
    // RGB formats
    FormatDescriptor::raw(PixelFormat::RGB24, 24, ALIGN_32, encoding::RGB24, 2),
    FormatDescriptor::raw(PixelFormat::BGR24, 24, ALIGN_32, encoding::BGR24, 2),
    FormatDescriptor::raw(PixelFormat::BGR32, 32, ALIGN_32, encoding::BGRA, 2),
    FormatDescriptor::raw(PixelFormat::RGBA32, 32, ALIGN_32, encoding::RGBA, 2),
    // Bayer formats
    FormatDescriptor::bayer(PixelFormat::SRGGB8, 8, encoding::BAYER_SRGGB8),
    FormatDescriptor::bayer(PixelFormat::SBGGR8, 8, encoding::BAYER_SBGGR8),
    FormatDescriptor::bayer(PixelFormat::SGRBG8, 8, encoding::BAYER_SGRBG8),
    FormatDescriptor::bayer(PixelFormat::SGBRG8, 8, encoding::BAYER_SGBRG8),
    FormatDescriptor::bayer(PixelFormat::SRGGB10P, 10, encoding::BAYER_SRGGB10P),
    FormatDescriptor::bayer(PixelFormat::SBGGR10P, 10, encoding::BAYER_SBGGR10P),
    FormatDescriptor::bayer(PixelFormat::SGRBG10P, 10, encoding::BAYER_SGRBG10P),
    FormatDescriptor::bayer(PixelFormat::SGBRG10P, 10, encoding::BAYER_SGBRG10P),
    FormatDescriptor::bayer(PixelFormat::SRGGB12P, 12, encoding::BAYER_SRGGB12P),
    FormatDescriptor::bayer(PixelFormat::SBGGR12P, 12, encoding::BAYER_SBGGR12P),
    FormatDescriptor::bayer(PixelFormat::SGRBG12P, 12, encoding::BAYER_SGRBG12P),
    FormatDescriptor::bayer(PixelFormat::SGBRG12P, 12, encoding::BAYER_SGBRG12P),
    FormatDescriptor::bayer(PixelFormat::SRGGB14P, 14, encoding::BAYER_SRGGB14P),
    FormatDescriptor::bayer(PixelFormat::SBGGR14P, 14, encoding::BAYER_SBGGR14P),
    FormatDescriptor::bayer(PixelFormat::SGRBG14P, 14, encoding::BAYER_SGRBG14P),
    FormatDescriptor::bayer(PixelFormat::SGBRG14P, 14, encoding::BAYER_SGBRG14P),
    FormatDescriptor::bayer(PixelFormat::SRGGB16, 16, encoding::BAYER_SRGGB16),
    FormatDescriptor::bayer(PixelFormat::SBGGR16, 16, encoding::BAYER_SBGGR16),
    FormatDescriptor::bayer(PixelFormat::SGRBG16, 16, encoding::BAYER_SGRBG16),
    FormatDescriptor::bayer(PixelFormat::SGBRG16, 16, encoding::BAYER_SGBRG16),
    // Unpacked Bayer formats, 16 bits per sample
    FormatDescriptor::bayer(PixelFormat::SRGGB10, 16, encoding::BAYER_SRGGB10),
    FormatDescriptor::bayer(PixelFormat::SBGGR10, 16, encoding::BAYER_SBGGR10),
    FormatDescriptor::bayer(PixelFormat::SGRBG10, 16, encoding::BAYER_SGRBG10),
    FormatDescriptor::bayer(PixelFormat::SGBRG10, 16, encoding::BAYER_SGBRG10),
    FormatDescriptor::bayer(PixelFormat::SRGGB12, 16, encoding::BAYER_SRGGB12),
    FormatDescriptor::bayer(PixelFormat::SBGGR12, 16, encoding::BAYER_SBGGR12),
    FormatDescriptor::bayer(PixelFormat::SGRBG12, 16, encoding::BAYER_SGRBG12),
    FormatDescriptor::bayer(PixelFormat::SGBRG12, 16, encoding::BAYER_SGBRG12),
    FormatDescriptor::bayer(PixelFormat::SRGGB14, 16, encoding::BAYER_SRGGB14),
    FormatDescriptor::bayer(PixelFormat::SBGGR14, 16, encoding::BAYER_SBGGR14),
    FormatDescriptor::bayer(PixelFormat::SGRBG14, 16, encoding::BAYER_SGRBG14),
    FormatDescriptor::bayer(PixelFormat::SGBRG14, 16, encoding::BAYER_SGBRG14),
    // Monochrome formats
    FormatDescriptor::raw(PixelFormat::GREY, 8, ALIGN_32, encoding::GREY, 2),
    FormatDescriptor::raw(PixelFormat::Y10P, 10, ALIGN_32, encoding::Y10P, 2),
    FormatDescriptor::raw(PixelFormat::Y12P, 12, ALIGN_32, encoding::Y12P, 2),
    FormatDescriptor::raw(PixelFormat::Y14P, 14, ALIGN_32, encoding::Y14P, 2),
    FormatDescriptor::raw(PixelFormat::Y16, 16, ALIGN_32, encoding::Y16, 2),
    FormatDescriptor::raw(PixelFormat::Y10, 16, ALIGN_32, encoding::Y10, 2),
    FormatDescriptor::raw(PixelFormat::Y12, 16, ALIGN_32, encoding::Y12, 2),
    FormatDescriptor::raw(PixelFormat::Y14, 16, ALIGN_32, encoding::Y14, 2),
    // Compressed formats
    FormatDescriptor::compressed(PixelFormat::H264, encoding::H264),
    FormatDescriptor::compressed(PixelFormat::JPEG, encoding::JPEG),
    FormatDescriptor::compressed(PixelFormat::MJPEG, encoding::MJPEG),
    FormatDescriptor::compressed(PixelFormat::MPEG4, encoding::MP4V),
    FormatDescriptor::compressed(PixelFormat::H263, encoding::H263),
    FormatDescriptor::compressed(PixelFormat::MPEG2, encoding::MP2V),
    FormatDescriptor::compressed(PixelFormat::VC1_ANNEX_G, encoding::WVC1),
];

/// Look `pixel_format` up in the static table. Bayer formats are skipped if `exclude_bayer` is
/// set.
pub fn lookup(pixel_format: PixelFormat, exclude_bayer: bool) -> Option<&'static FormatDescriptor> {
    SUPPORTED_FORMATS
        .iter()
        .find(|f| f.pixel_format == pixel_format && !(exclude_bayer && f.bayer))
}

/// Look up the format using accelerator encoding `encoding`.
pub fn lookup_encoding(encoding: u32, exclude_bayer: bool) -> Option<&'static FormatDescriptor> {
    SUPPORTED_FORMATS
        .iter()
        .find(|f| f.encoding == encoding && !(exclude_bayer && f.bayer))
}

/// Formats available on each queue of a device instance.
///
/// Built once per device instance by intersecting the encodings supported by the accelerator
/// component's ports with [`SUPPORTED_FORMATS`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatCatalog {
    /// Formats for the `OUTPUT` queue, i.e. the accelerator's input port.
    output: Vec<&'static FormatDescriptor>,
    /// Formats for the `CAPTURE` queue, i.e. the accelerator's output port.
    capture: Vec<&'static FormatDescriptor>,
}

impl FormatCatalog {
    pub fn from_encodings(input_port: &[u32], output_port: &[u32], exclude_bayer: bool) -> Self {
        let intersect = |encodings: &[u32]| {
            if encodings.len() > MAX_SUPPORTED_ENCODINGS {
                log::warn!(
                    "port supports {} encodings, only considering the first {}",
                    encodings.len(),
                    MAX_SUPPORTED_ENCODINGS
                );
            }
            encodings
                .iter()
                .take(MAX_SUPPORTED_ENCODINGS)
                .filter_map(|&e| {
                    let format = lookup_encoding(e, exclude_bayer);
                    if format.is_none() {
                        log::debug!("ignoring unknown encoding {:#010x}", e);
                    }
                    format
                })
                .collect::<Vec<_>>()
        };

        Self {
            output: intersect(input_port),
            capture: intersect(output_port),
        }
    }

    pub fn formats(&self, direction: QueueDirection) -> &[&'static FormatDescriptor] {
        match direction {
            QueueDirection::Output => &self.output,
            QueueDirection::Capture => &self.capture,
        }
    }

    pub fn find(
        &self,
        direction: QueueDirection,
        pixel_format: PixelFormat,
    ) -> Option<&'static FormatDescriptor> {
        self.formats(direction)
            .iter()
            .find(|f| f.pixel_format == pixel_format)
            .copied()
    }

    /// Format used for `direction` when the client does not pick one.
    pub fn default_format(&self, direction: QueueDirection) -> Option<&'static FormatDescriptor> {
        self.formats(direction).first().copied()
    }

    /// Whether `pixel_format` is usable on either queue.
    pub fn contains(&self, pixel_format: PixelFormat) -> bool {
        self.find(QueueDirection::Output, pixel_format).is_some()
            || self.find(QueueDirection::Capture, pixel_format).is_some()
    }
}
