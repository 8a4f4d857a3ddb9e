/// Workflow state and the records the orchestrator keeps between steps
///
/// Exactly one workflow state is current at a time. The records hold what
/// the adapters have reported so far about the tool, the device and the
/// available package.

use std::fmt;

use devadapter::{FirmwareVersions, PackageManifest, ProductDetails};
use serde::{Deserialize, Serialize};

/// One step of the update workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    Welcome,
    CheckingForUpdate,
    CheckFailedOffline,
    CheckFailedCached,
    ConnectPrompt,
    Detecting,
    DetectionFailed,
    DetectingManual,
    DetectedAvailable,
    DetectedCurrent,
    Updating,
    UpdateComplete,
    UpdateFailed,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 13] = [
        WorkflowState::Welcome,
        WorkflowState::CheckingForUpdate,
        WorkflowState::CheckFailedOffline,
        WorkflowState::CheckFailedCached,
        WorkflowState::ConnectPrompt,
        WorkflowState::Detecting,
        WorkflowState::DetectionFailed,
        WorkflowState::DetectingManual,
        WorkflowState::DetectedAvailable,
        WorkflowState::DetectedCurrent,
        WorkflowState::Updating,
        WorkflowState::UpdateComplete,
        WorkflowState::UpdateFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Welcome => "Welcome",
            WorkflowState::CheckingForUpdate => "CheckingForUpdate",
            WorkflowState::CheckFailedOffline => "CheckFailedOffline",
            WorkflowState::CheckFailedCached => "CheckFailedCached",
            WorkflowState::ConnectPrompt => "ConnectPrompt",
            WorkflowState::Detecting => "Detecting",
            WorkflowState::DetectionFailed => "DetectionFailed",
            WorkflowState::DetectingManual => "DetectingManual",
            WorkflowState::DetectedAvailable => "DetectedAvailable",
            WorkflowState::DetectedCurrent => "DetectedCurrent",
            WorkflowState::Updating => "Updating",
            WorkflowState::UpdateComplete => "UpdateComplete",
            WorkflowState::UpdateFailed => "UpdateFailed",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data gathered from the adapters
#[derive(Debug, Clone, Default)]
pub struct Records {
    pub utility_version: Option<String>,
    pub devices: Vec<String>,
    pub selected_device: Option<String>,
    pub product: ProductDetails,
    pub firmware: Option<FirmwareVersions>,
    pub package: Option<PackageManifest>,
}

impl Records {
    /// Forget everything learned from the last connected device
    pub fn clear_device(&mut self) {
        self.product = ProductDetails::default();
        self.firmware = None;
    }

    /// True when the device already runs every component version in the package
    pub fn firmware_is_current(&self) -> bool {
        let (Some(package), Some(firmware)) = (&self.package, &self.firmware) else {
            return false;
        };
        !package.components.is_empty()
            && package.components.iter().all(|component| {
                component.version.is_some() && firmware.get(&component.name) == component.version.as_deref()
            })
    }
}
