// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed parameters and event payloads exchanged with accelerator components.
//!
//! All these structures are plain `#[repr(C)]` blobs that are passed as-is to
//! [`super::AcceleratorComponent::set_param`] and [`super::AcceleratorComponent::get_param`].
//! Boolean parameters are passed as `u32`.

use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Parameters of components and ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterId {
    ZeroCopy,
    VideoValidateTimestamps,
    VideoStopOnParColourChange,
    ImageEffectParameters,
    ExifDisable,
    JpegIjgScaling,
    JpegQFactor,
    VideoEncodeSpsTiming,
    VideoEncodeHeadersWithFrame,
    VideoEncodeInlineHeader,
    VideoEncodeSeiEnable,
    VideoEncodeMinQuant,
    VideoEncodeMaxQuant,
    VideoEncodeH264AuDelimiters,
    MinimiseFragmentation,
    VideoInterlaceType,
    VideoBitRate,
    RateControl,
    IntraPeriod,
    Profile,
    VideoRequestIFrame,
    VideoIntraRefresh,
    MbRowsPerSlice,
    Mirror,
}

/// Image effects supported by the image effect component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ImageEffect {
    None = 0,
    DeinterlaceDouble = 23,
    DeinterlaceAdvanced = 24,
    DeinterlaceFast = 25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct ImageFxParameters {
    pub effect: u32,
    pub num_effect_params: u32,
    pub effect_parameter: [u32; 16],
}

impl ImageFxParameters {
    pub fn new(effect: ImageEffect, params: &[u32]) -> Self {
        let mut effect_parameter = [0u32; 16];
        let num = params.len().min(effect_parameter.len());
        effect_parameter[..num].copy_from_slice(&params[..num]);

        Self {
            effect: effect as u32,
            num_effect_params: num as u32,
            effect_parameter,
        }
    }
}

/// Interlacing of the frames produced by a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum InterlaceMode {
    Progressive = 0,
    FieldSingleUpperFirst = 1,
    FieldSingleLowerFirst = 2,
    FieldsInterleavedUpperFirst = 3,
    FieldsInterleavedLowerFirst = 4,
    FieldsMixed = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct InterlaceTypeParam {
    pub mode: u32,
    pub is_repeat_first_field: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum RateControlMode {
    Default = 0,
    Variable = 1,
    Constant = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum MirrorMode {
    None = 0,
    Vertical = 1,
    Horizontal = 2,
    Both = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum H264Profile {
    Baseline = 25,
    Main = 26,
    High = 28,
    ConstrainedBaseline = 32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum H264Level {
    L1 = 16,
    L1b = 17,
    L11 = 18,
    L12 = 19,
    L13 = 20,
    L2 = 21,
    L21 = 22,
    L22 = 23,
    L3 = 24,
    L31 = 25,
    L32 = 26,
    L4 = 27,
    L41 = 28,
    L42 = 29,
    L5 = 30,
    L51 = 31,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct VideoProfileParam {
    pub profile: u32,
    pub level: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum IntraRefreshMode {
    CyclicRows = 0,
    Adaptive = 1,
    Both = 2,
    CyclicMacroblockRows = 0x7f00_0001,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct IntraRefreshParam {
    pub refresh_mode: u32,
    pub air_mbs: u32,
    pub air_ref: u32,
    pub cir_mbs: u32,
    pub pir_mbs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct RectParam {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct RationalParam {
    pub numerator: i32,
    pub denominator: i32,
}

/// Payload of a format changed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct FormatChangedEvent {
    pub buffer_size_min: u32,
    pub buffer_num_min: u32,
    pub buffer_size_recommended: u32,
    pub buffer_num_recommended: u32,
    /// One of [`super::EsType`].
    pub es_type: u32,
    pub encoding: u32,
    pub encoding_variant: u32,
    pub width: u32,
    pub height: u32,
    pub crop: RectParam,
    pub frame_rate: RationalParam,
    pub par: RationalParam,
    pub color_space: u32,
}

#[cfg(test)]
mod tests {
    use zerocopy::AsBytes;
    use zerocopy::FromBytes;

    use super::FormatChangedEvent;
    use super::ImageEffect;
    use super::ImageFxParameters;

    #[test]
    fn imagefx_parameters_layout() {
        let params = ImageFxParameters::new(ImageEffect::DeinterlaceFast, &[5, u32::MAX, 0, 0]);
        assert_eq!(params.num_effect_params, 4);
        assert_eq!(params.as_bytes().len(), 18 * 4);
        assert_eq!(&params.as_bytes()[..4], &25u32.to_ne_bytes());
    }

    #[test]
    fn format_changed_event_from_short_payload() {
        let payload = [0u8; 8];
        assert!(FormatChangedEvent::read_from_prefix(&payload[..]).is_none());

        let event = FormatChangedEvent {
            width: 1920,
            height: 1088,
            ..Default::default()
        };
        let mut payload = event.as_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 16]);
        assert_eq!(
            FormatChangedEvent::read_from_prefix(&payload[..]),
            Some(event)
        );
    }
}
