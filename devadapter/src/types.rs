/// Records and outcomes produced by the device adapters
///
/// This module defines the data handed from the adapters back to their
/// callers: utility command output, product details parsed from the
/// configuration utility and firmware versions read over the debug session.

use serde::{Deserialize, Serialize};

/// Exit status reported when the utility was killed, timed out or never ran
pub const GENERIC_FAILURE: i32 = 1;

/// Output of a completed buffered utility run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub lines: Vec<String>,
    pub status: i32,
}

impl CommandOutput {
    pub fn new(lines: Vec<String>, status: i32) -> Self {
        Self { lines, status }
    }

    /// Zero-length result used when a command could not be started
    pub fn failed() -> Self {
        Self {
            lines: Vec::new(),
            status: GENERIC_FAILURE,
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Identity of the connected device as reported by the utility
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDetails {
    pub product_name: Option<String>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub hardware_revision: Option<String>,
    pub firmware_version: Option<String>,
}

impl ProductDetails {
    /// True when no label was recognised in the utility output
    pub fn is_empty(&self) -> bool {
        self.product_name.is_none()
            && self.model_number.is_none()
            && self.serial_number.is_none()
            && self.hardware_revision.is_none()
            && self.firmware_version.is_none()
    }
}

/// Firmware component versions read from the device's manufacturing prompt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareVersions {
    pub application: Option<String>,
    pub bootloader: Option<String>,
    pub radio: Option<String>,
}

impl FirmwareVersions {
    /// Look up a version by package component name
    pub fn get(&self, component: &str) -> Option<&str> {
        let version = match component.to_ascii_lowercase().as_str() {
            "application" | "app" => &self.application,
            "bootloader" | "boot" => &self.bootloader,
            "radio" => &self.radio,
            _ => return None,
        };
        version.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.application.is_none() && self.bootloader.is_none() && self.radio.is_none()
    }
}
