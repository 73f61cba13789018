// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stride and buffer size computations.
//!
//! These functions expect their width and height to have already been clamped to the limits of
//! the device.

use crate::format::FormatDescriptor;
use crate::protocol::PixelFormat;
use crate::role::Role;

pub const MIN_WIDTH: u32 = 32;
pub const MIN_HEIGHT: u32 = 32;

/// Resolution of new sessions. Purposely implausible so the first real format is always seen as
/// a change.
pub const DEFAULT_WIDTH: u32 = 32;
pub const DEFAULT_HEIGHT: u32 = 32;

/// Buffer size for compressed frames up to 1280x720 pixels.
pub const COMPRESSED_SIZE_720P_OR_LESS: u32 = 512 << 10;
/// Buffer size for compressed frames larger than 1280x720 pixels.
pub const COMPRESSED_SIZE_GREATER_720P: u32 = 768 << 10;
/// Buffer size for JPEG images, whatever their resolution.
pub const COMPRESSED_SIZE_JPEG: u32 = 4096 << 10;

/// Height alignment of uncompressed frames, for the roles requiring it.
pub const FRAME_HEIGHT_ALIGN: u32 = 16;

/// Round `value` up to the next multiple of `align`. An alignment of 0 leaves `value` untouched.
pub fn align_up(value: u32, align: u32) -> u32 {
    if align == 0 {
        return value;
    }

    value.div_ceil(align).saturating_mul(align)
}

/// Minimum bytes per line of a `width`x`height` frame of `format`, when used by `role`.
///
/// The column format stores the column stride, in lines, instead.
pub fn stride_for(width: u32, height: u32, format: &FormatDescriptor, role: Role) -> u32 {
    if format.is_column_format() {
        return height.saturating_mul(3) >> 1;
    }

    align_up(
        width.saturating_mul(format.depth) >> 3,
        format.stride_align(role),
    )
}

/// Size of a buffer holding a `width`x`height` frame of `format`, with `stride` bytes per line.
pub fn buffer_size_for(stride: u32, width: u32, height: u32, format: &FormatDescriptor) -> u32 {
    if format.compressed {
        if format.pixel_format == PixelFormat::JPEG {
            return COMPRESSED_SIZE_JPEG;
        }

        return if width.saturating_mul(height) > 1280 * 720 {
            COMPRESSED_SIZE_GREATER_720P
        } else {
            COMPRESSED_SIZE_720P_OR_LESS
        };
    }

    if format.is_column_format() {
        // `stride` is the column height, and columns are 128 bytes wide.
        return align_up(width, 128).saturating_mul(stride);
    }

    (stride.saturating_mul(height).saturating_mul(format.size_multiplier_x2)) >> 1
}
