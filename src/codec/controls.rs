// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client controls of the transform sessions.
//!
//! Control values are cached in the session, so they can be set before the component exists, and
//! applied to the component when it is created and every time they change afterwards.

use log::error;
use log::warn;

use crate::accel::params::H264Level;
use crate::accel::params::H264Profile;
use crate::accel::params::IntraRefreshMode;
use crate::accel::params::IntraRefreshParam;
use crate::accel::params::MirrorMode;
use crate::accel::params::RateControlMode;
use crate::accel::params::VideoProfileParam;
use crate::accel::AccelError;
use crate::accel::AcceleratorComponent;
use crate::accel::AcceleratorService;
use crate::accel::ParameterId;
use crate::accel::PortId;
use crate::role::Role;
use crate::ClientEventQueue;
use crate::IoctlResult;

use super::CodecDevice;
use super::CodecSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlId {
    Bitrate,
    BitrateMode,
    RepeatSequenceHeader,
    HeaderMode,
    IFramePeriod,
    GopSize,
    H264Profile,
    H264Level,
    H264MinQp,
    H264MaxQp,
    ForceKeyFrame,
    IntraRefreshPeriod,
    AccessUnitDelimiter,
    SliceMaxMacroblocks,
    HFlip,
    VFlip,
    JpegQuality,
    MinBuffersForCapture,
}

const ENCODE_CONTROLS: [ControlId; 14] = [
    ControlId::Bitrate,
    ControlId::BitrateMode,
    ControlId::RepeatSequenceHeader,
    ControlId::HeaderMode,
    ControlId::IFramePeriod,
    ControlId::GopSize,
    ControlId::H264Profile,
    ControlId::H264Level,
    ControlId::H264MinQp,
    ControlId::H264MaxQp,
    ControlId::ForceKeyFrame,
    ControlId::IntraRefreshPeriod,
    ControlId::AccessUnitDelimiter,
    ControlId::SliceMaxMacroblocks,
];
const ISP_CONTROLS: [ControlId; 2] = [ControlId::HFlip, ControlId::VFlip];
const ENCODE_IMAGE_CONTROLS: [ControlId; 1] = [ControlId::JpegQuality];
const DECODE_CONTROLS: [ControlId; 1] = [ControlId::MinBuffersForCapture];

impl ControlId {
    /// Controls exposed by devices of `role`.
    pub fn for_role(role: Role) -> &'static [ControlId] {
        match role {
            Role::Decode => &DECODE_CONTROLS,
            Role::Encode => &ENCODE_CONTROLS,
            Role::Isp => &ISP_CONTROLS,
            Role::EncodeImage => &ENCODE_IMAGE_CONTROLS,
            Role::Deinterlace => &[],
        }
    }

    pub fn is_read_only(self) -> bool {
        self == ControlId::MinBuffersForCapture
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateMode {
    Vbr,
    Cbr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    Separate,
    JoinedWith1stFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoProfile {
    Baseline,
    ConstrainedBaseline,
    Main,
    High,
}

impl From<VideoProfile> for H264Profile {
    fn from(profile: VideoProfile) -> Self {
        match profile {
            VideoProfile::Baseline => H264Profile::Baseline,
            VideoProfile::ConstrainedBaseline => H264Profile::ConstrainedBaseline,
            VideoProfile::Main => H264Profile::Main,
            VideoProfile::High => H264Profile::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoLevel {
    L1_0,
    L1B,
    L1_1,
    L1_2,
    L1_3,
    L2_0,
    L2_1,
    L2_2,
    L3_0,
    L3_1,
    L3_2,
    L4_0,
    L4_1,
    L4_2,
    L5_0,
    L5_1,
}

impl From<VideoLevel> for H264Level {
    fn from(level: VideoLevel) -> Self {
        match level {
            VideoLevel::L1_0 => H264Level::L1,
            VideoLevel::L1B => H264Level::L1b,
            VideoLevel::L1_1 => H264Level::L11,
            VideoLevel::L1_2 => H264Level::L12,
            VideoLevel::L1_3 => H264Level::L13,
            VideoLevel::L2_0 => H264Level::L2,
            VideoLevel::L2_1 => H264Level::L21,
            VideoLevel::L2_2 => H264Level::L22,
            VideoLevel::L3_0 => H264Level::L3,
            VideoLevel::L3_1 => H264Level::L31,
            VideoLevel::L3_2 => H264Level::L32,
            VideoLevel::L4_0 => H264Level::L4,
            // The hardware is rated for level 4.0. Higher levels only affect the stream headers.
            VideoLevel::L4_1 => H264Level::L41,
            VideoLevel::L4_2 => H264Level::L42,
            VideoLevel::L5_0 => H264Level::L5,
            VideoLevel::L5_1 => H264Level::L51,
        }
    }
}

/// A control and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Target bitrate, in bits per second.
    Bitrate(u32),
    BitrateMode(BitrateMode),
    RepeatSequenceHeader(bool),
    HeaderMode(HeaderMode),
    /// Same as `GopSize`.
    IFramePeriod(u32),
    GopSize(u32),
    H264Profile(VideoProfile),
    H264Level(VideoLevel),
    H264MinQp(u32),
    H264MaxQp(u32),
    /// Write-only, requests the next frame to be a key frame.
    ForceKeyFrame,
    /// Number of macroblock rows refreshed per frame, or -1 to keep the accelerator's setting.
    IntraRefreshPeriod(i32),
    AccessUnitDelimiter(bool),
    /// Macroblock rows per slice, or -1 for a single slice.
    SliceMaxMacroblocks(i32),
    HFlip(bool),
    VFlip(bool),
    JpegQuality(u32),
    MinBuffersForCapture(u32),
}

impl Control {
    pub fn id(&self) -> ControlId {
        match self {
            Control::Bitrate(_) => ControlId::Bitrate,
            Control::BitrateMode(_) => ControlId::BitrateMode,
            Control::RepeatSequenceHeader(_) => ControlId::RepeatSequenceHeader,
            Control::HeaderMode(_) => ControlId::HeaderMode,
            Control::IFramePeriod(_) => ControlId::IFramePeriod,
            Control::GopSize(_) => ControlId::GopSize,
            Control::H264Profile(_) => ControlId::H264Profile,
            Control::H264Level(_) => ControlId::H264Level,
            Control::H264MinQp(_) => ControlId::H264MinQp,
            Control::H264MaxQp(_) => ControlId::H264MaxQp,
            Control::ForceKeyFrame => ControlId::ForceKeyFrame,
            Control::IntraRefreshPeriod(_) => ControlId::IntraRefreshPeriod,
            Control::AccessUnitDelimiter(_) => ControlId::AccessUnitDelimiter,
            Control::SliceMaxMacroblocks(_) => ControlId::SliceMaxMacroblocks,
            Control::HFlip(_) => ControlId::HFlip,
            Control::VFlip(_) => ControlId::VFlip,
            Control::JpegQuality(_) => ControlId::JpegQuality,
            Control::MinBuffersForCapture(_) => ControlId::MinBuffersForCapture,
        }
    }

    /// Whether the value is within the range accepted for the control.
    fn in_range(&self) -> bool {
        match *self {
            Control::Bitrate(bitrate) => (25_000..=25_000_000).contains(&bitrate),
            Control::H264MinQp(qp) | Control::H264MaxQp(qp) => qp <= 51,
            Control::IntraRefreshPeriod(v) | Control::SliceMaxMacroblocks(v) => {
                (-1..=30_000).contains(&v)
            }
            Control::JpegQuality(quality) => (1..=100).contains(&quality),
            _ => true,
        }
    }
}

/// Cached values of the controls of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controls {
    pub bitrate: u32,
    pub bitrate_mode: BitrateMode,
    pub repeat_sequence_header: bool,
    pub header_mode: HeaderMode,
    pub gop_size: u32,
    pub profile: VideoProfile,
    pub level: VideoLevel,
    pub min_qp: u32,
    pub max_qp: u32,
    pub intra_refresh_period: i32,
    pub access_unit_delimiter: bool,
    pub slice_max_macroblocks: i32,
    pub hflip: bool,
    pub vflip: bool,
    pub jpeg_quality: u32,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            bitrate: 10_000_000,
            bitrate_mode: BitrateMode::Vbr,
            repeat_sequence_header: false,
            header_mode: HeaderMode::JoinedWith1stFrame,
            gop_size: 60,
            profile: VideoProfile::High,
            level: VideoLevel::L4_0,
            min_qp: 20,
            max_qp: 51,
            intra_refresh_period: -1,
            access_unit_delimiter: false,
            slice_max_macroblocks: -1,
            hflip: false,
            vflip: false,
            jpeg_quality: 80,
        }
    }
}

impl Controls {
    /// Current value of control `id`.
    pub fn get(&self, id: ControlId) -> Control {
        match id {
            ControlId::Bitrate => Control::Bitrate(self.bitrate),
            ControlId::BitrateMode => Control::BitrateMode(self.bitrate_mode),
            ControlId::RepeatSequenceHeader => {
                Control::RepeatSequenceHeader(self.repeat_sequence_header)
            }
            ControlId::HeaderMode => Control::HeaderMode(self.header_mode),
            ControlId::IFramePeriod => Control::IFramePeriod(self.gop_size),
            ControlId::GopSize => Control::GopSize(self.gop_size),
            ControlId::H264Profile => Control::H264Profile(self.profile),
            ControlId::H264Level => Control::H264Level(self.level),
            ControlId::H264MinQp => Control::H264MinQp(self.min_qp),
            ControlId::H264MaxQp => Control::H264MaxQp(self.max_qp),
            ControlId::ForceKeyFrame => Control::ForceKeyFrame,
            ControlId::IntraRefreshPeriod => Control::IntraRefreshPeriod(self.intra_refresh_period),
            ControlId::AccessUnitDelimiter => {
                Control::AccessUnitDelimiter(self.access_unit_delimiter)
            }
            ControlId::SliceMaxMacroblocks => {
                Control::SliceMaxMacroblocks(self.slice_max_macroblocks)
            }
            ControlId::HFlip => Control::HFlip(self.hflip),
            ControlId::VFlip => Control::VFlip(self.vflip),
            ControlId::JpegQuality => Control::JpegQuality(self.jpeg_quality),
            ControlId::MinBuffersForCapture => Control::MinBuffersForCapture(1),
        }
    }

    fn set(&mut self, control: Control) {
        match control {
            Control::Bitrate(v) => self.bitrate = v,
            Control::BitrateMode(v) => self.bitrate_mode = v,
            Control::RepeatSequenceHeader(v) => self.repeat_sequence_header = v,
            Control::HeaderMode(v) => self.header_mode = v,
            Control::IFramePeriod(v) | Control::GopSize(v) => self.gop_size = v,
            Control::H264Profile(v) => self.profile = v,
            Control::H264Level(v) => self.level = v,
            Control::H264MinQp(v) => self.min_qp = v,
            Control::H264MaxQp(v) => self.max_qp = v,
            Control::IntraRefreshPeriod(v) => self.intra_refresh_period = v,
            Control::AccessUnitDelimiter(v) => self.access_unit_delimiter = v,
            Control::SliceMaxMacroblocks(v) => self.slice_max_macroblocks = v,
            Control::HFlip(v) => self.hflip = v,
            Control::VFlip(v) => self.vflip = v,
            Control::JpegQuality(v) => self.jpeg_quality = v,
            Control::ForceKeyFrame | Control::MinBuffersForCapture(_) => (),
        }
    }

    fn mirror_mode(&self) -> MirrorMode {
        match (self.hflip, self.vflip) {
            (true, true) => MirrorMode::Both,
            (true, false) => MirrorMode::Horizontal,
            (false, true) => MirrorMode::Vertical,
            (false, false) => MirrorMode::None,
        }
    }
}

impl<A: AcceleratorService, E: ClientEventQueue> CodecSession<A, E> {
    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    /// Apply `control` to the component, using the cached values for related controls.
    fn apply_control(&mut self, control: Control) -> Result<(), AccelError> {
        let mirror = self.controls.mirror_mode();
        let Some(component) = self.component.as_mut() else {
            return Ok(());
        };
        let bool_param = |v: bool| v as u32;

        match control {
            Control::Bitrate(bitrate) => {
                component.set_param(PortId::Output, ParameterId::VideoBitRate, &bitrate)
            }
            Control::BitrateMode(mode) => {
                let mode = match mode {
                    BitrateMode::Vbr => RateControlMode::Variable,
                    BitrateMode::Cbr => RateControlMode::Constant,
                };
                component.set_param(PortId::Output, ParameterId::RateControl, &(mode as u32))
            }
            Control::RepeatSequenceHeader(repeat) => component.set_param(
                PortId::Output,
                ParameterId::VideoEncodeInlineHeader,
                &bool_param(repeat),
            ),
            Control::HeaderMode(mode) => component.set_param(
                PortId::Output,
                ParameterId::VideoEncodeHeadersWithFrame,
                &bool_param(mode == HeaderMode::JoinedWith1stFrame),
            ),
            Control::IFramePeriod(period) | Control::GopSize(period) => {
                component.set_param(PortId::Output, ParameterId::IntraPeriod, &period)
            }
            Control::H264Profile(_) | Control::H264Level(_) => {
                // Profile and level share a parameter, only update the one that changed.
                let mut param: VideoProfileParam =
                    component.get_param(PortId::Output, ParameterId::Profile)?;
                match control {
                    Control::H264Profile(profile) => {
                        param.profile = H264Profile::from(profile) as u32
                    }
                    Control::H264Level(level) => param.level = H264Level::from(level) as u32,
                    _ => (),
                }
                component.set_param(PortId::Output, ParameterId::Profile, &param)
            }
            Control::H264MinQp(qp) => {
                component.set_param(PortId::Output, ParameterId::VideoEncodeMinQuant, &qp)
            }
            Control::H264MaxQp(qp) => {
                component.set_param(PortId::Output, ParameterId::VideoEncodeMaxQuant, &qp)
            }
            Control::ForceKeyFrame => {
                component.set_param(PortId::Output, ParameterId::VideoRequestIFrame, &1u32)
            }
            Control::IntraRefreshPeriod(period) => {
                if period <= 0 {
                    return Ok(());
                }
                let mut param = component
                    .get_param::<IntraRefreshParam>(PortId::Output, ParameterId::VideoIntraRefresh)
                    .unwrap_or_else(|e| {
                        warn!(
                            "session {}: cannot read current intra refresh, using defaults: {}",
                            self.id, e
                        );
                        IntraRefreshParam::default()
                    });
                param.refresh_mode = IntraRefreshMode::CyclicMacroblockRows as u32;
                param.cir_mbs = period as u32;
                component.set_param(PortId::Output, ParameterId::VideoIntraRefresh, &param)
            }
            Control::AccessUnitDelimiter(enabled) => component.set_param(
                PortId::Output,
                ParameterId::VideoEncodeH264AuDelimiters,
                &bool_param(enabled),
            ),
            Control::SliceMaxMacroblocks(rows) => {
                if rows <= 0 {
                    return Ok(());
                }
                component.set_param(PortId::Output, ParameterId::MbRowsPerSlice, &(rows as u32))
            }
            Control::HFlip(_) | Control::VFlip(_) => {
                component.set_param(PortId::Input, ParameterId::Mirror, &(mirror as u32))
            }
            Control::JpegQuality(quality) => {
                component.set_param(PortId::Output, ParameterId::JpegQFactor, &quality)
            }
            Control::MinBuffersForCapture(_) => Ok(()),
        }
    }

    /// Apply all the cached controls of the role to a newly created component.
    pub(super) fn apply_controls(&mut self) {
        for &id in ControlId::for_role(self.role) {
            // Actions and read-only values have nothing to restore. `IFramePeriod` duplicates
            // `GopSize`.
            if matches!(
                id,
                ControlId::ForceKeyFrame
                    | ControlId::MinBuffersForCapture
                    | ControlId::IFramePeriod
            ) {
                continue;
            }

            let control = self.controls.get(id);
            if let Err(e) = self.apply_control(control) {
                error!(
                    "session {}: failed to apply control {:?}: {}",
                    self.id, control, e
                );
            }
        }
    }
}

impl<A: AcceleratorService> CodecDevice<A> {
    /// Controls exposed by the device.
    pub fn query_ctrls(&self) -> &'static [ControlId] {
        ControlId::for_role(self.role)
    }

    pub fn g_ctrl<E: ClientEventQueue>(
        &self,
        session: &CodecSession<A, E>,
        id: ControlId,
    ) -> IoctlResult<Control> {
        if !ControlId::for_role(self.role).contains(&id) {
            return Err(libc::EINVAL);
        }

        Ok(session.controls.get(id))
    }

    pub fn s_ctrl<E: ClientEventQueue>(
        &self,
        session: &mut CodecSession<A, E>,
        control: Control,
    ) -> IoctlResult<()> {
        let id = control.id();
        if !ControlId::for_role(self.role).contains(&id) {
            return Err(libc::EINVAL);
        }
        if id.is_read_only() {
            return Err(libc::EACCES);
        }
        if !control.in_range() {
            return Err(libc::ERANGE);
        }

        let _service = self.lock();
        session.controls.set(control);
        session.apply_control(control).map_err(|e| {
            error!(
                "session {}: failed to set control {:?}: {}",
                session.id, control, e
            );
            libc::EINVAL
        })
    }
}
