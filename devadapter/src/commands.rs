/// Configuration utility command lines
///
/// Argument builders for the operations the workflow asks of the external
/// utility. The utility path itself is fixed per gateway.

use std::path::PathBuf;

pub const VERSION_FLAG: &str = "-v";
pub const LIST_FLAG: &str = "--list";
pub const DEVICE_FLAG: &str = "--device";
pub const INFO_FLAG: &str = "--info";
pub const PROGRAM_FLAG: &str = "--program";

pub fn version_args() -> Vec<String> {
    vec![VERSION_FLAG.to_string()]
}

pub fn list_devices_args() -> Vec<String> {
    vec![LIST_FLAG.to_string()]
}

pub fn discover_args(device: &str) -> Vec<String> {
    vec![DEVICE_FLAG.to_string(), device.to_string(), INFO_FLAG.to_string()]
}

/// Reprogram `device` with each image in order
pub fn reprogram_args(device: &str, images: &[PathBuf]) -> Vec<String> {
    let mut args = vec![
        DEVICE_FLAG.to_string(),
        device.to_string(),
        PROGRAM_FLAG.to_string(),
    ];
    args.extend(images.iter().map(|image| image.display().to_string()));
    args
}
