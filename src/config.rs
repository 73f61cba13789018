// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use crate::protocol::Field;

/// How long stopping a queue waits for the accelerator to return its buffers.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables of a device instance, fixed at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Hide the Bayer formats from the catalog.
    pub disable_bayer: bool,
    /// Use the advanced deinterlacing algorithm when the input is small enough for it.
    pub advanced_deinterlace: bool,
    /// Field reported to the accelerator for every input buffer, regardless of what the client
    /// set.
    pub field_override: Option<Field>,
    pub drain_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            disable_bayer: false,
            advanced_deinterlace: true,
            field_override: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}
