// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Roles a device instance can fulfill, and the static configuration attached to each of them.

use bitflags::bitflags;

/// Transform performed by a device instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Decode,
    Encode,
    Isp,
    Deinterlace,
    EncodeImage,
}

bitflags! {
    /// Optional client operations a role supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoleOps: u32 {
        /// `TRY_DECODER_CMD` and `DECODER_CMD`.
        const DECODER_CMD = 1 << 0;
        /// `TRY_ENCODER_CMD` and `ENCODER_CMD`.
        const ENCODER_CMD = 1 << 1;
        /// `G_PARM` and `S_PARM`.
        const STREAM_PARAMS = 1 << 2;
        /// `G_PIXELASPECT`.
        const PIXEL_ASPECT = 1 << 3;
    }
}

/// Largest frame the codec components accept.
pub const MAX_CODEC_WIDTH: u32 = 1920;
pub const MAX_CODEC_HEIGHT: u32 = 1920;
/// Largest frame the ISP component accepts.
pub const MAX_ISP_WIDTH: u32 = 16384;
pub const MAX_ISP_HEIGHT: u32 = 16384;

/// Static description of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleConfig {
    pub role: Role,
    /// Name of the device instance, as shown to clients.
    pub name: &'static str,
    /// Name of the accelerator component performing the transform.
    pub component: &'static str,
    pub max_width: u32,
    pub max_height: u32,
    pub ops: RoleOps,
}

const ROLE_CONFIGS: [RoleConfig; 5] = [
    RoleConfig {
        role: Role::Decode,
        name: "decode",
        component: "ril.video_decode",
        max_width: MAX_CODEC_WIDTH,
        max_height: MAX_CODEC_HEIGHT,
        ops: RoleOps::DECODER_CMD.union(RoleOps::PIXEL_ASPECT),
    },
    RoleConfig {
        role: Role::Encode,
        name: "encode",
        component: "ril.video_encode",
        max_width: MAX_CODEC_WIDTH,
        max_height: MAX_CODEC_HEIGHT,
        ops: RoleOps::ENCODER_CMD.union(RoleOps::STREAM_PARAMS),
    },
    RoleConfig {
        role: Role::Isp,
        name: "isp",
        component: "ril.isp",
        max_width: MAX_ISP_WIDTH,
        max_height: MAX_ISP_HEIGHT,
        ops: RoleOps::ENCODER_CMD,
    },
    RoleConfig {
        role: Role::Deinterlace,
        name: "image_fx",
        component: "ril.image_fx",
        max_width: MAX_CODEC_WIDTH,
        max_height: MAX_CODEC_HEIGHT,
        ops: RoleOps::ENCODER_CMD,
    },
    RoleConfig {
        role: Role::EncodeImage,
        name: "encode_image",
        component: "ril.image_encode",
        max_width: MAX_CODEC_WIDTH,
        max_height: MAX_CODEC_HEIGHT,
        ops: RoleOps::ENCODER_CMD.union(RoleOps::STREAM_PARAMS),
    },
];

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Decode,
        Role::Encode,
        Role::Isp,
        Role::Deinterlace,
        Role::EncodeImage,
    ];

    pub fn config(self) -> &'static RoleConfig {
        // `ROLE_CONFIGS` is ordered like `Role::ALL`.
        &ROLE_CONFIGS[self as usize]
    }

    /// Whether uncompressed frames must have a height that is a multiple of 16 lines.
    pub fn aligns_frame_height(self) -> bool {
        matches!(self, Role::Decode | Role::EncodeImage)
    }

    /// Whether the input can carry interlaced content that the role understands.
    pub fn handles_interlaced(self) -> bool {
        matches!(self, Role::Decode | Role::Deinterlace)
    }

    pub fn supports(self, ops: RoleOps) -> bool {
        self.config().ops.contains(ops)
    }
}
