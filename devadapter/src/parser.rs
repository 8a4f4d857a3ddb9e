/// Line-oriented output parsing
///
/// The configuration utility and the manufacturing prompt both answer with
/// `Label: value` lines. This module maps those lines onto records through
/// fixed label tables and extracts reprogramming progress from streamed text.

use crate::types::{FirmwareVersions, ProductDetails};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Labels printed by the utility's device info command
pub const PRODUCT_LABELS: &[(&str, &str)] = &[
    ("Product Name", "product_name"),
    ("Model Number", "model_number"),
    ("Serial Number", "serial_number"),
    ("Hardware Revision", "hardware_revision"),
    ("Firmware Version", "firmware_version"),
];

/// Labels printed by `mfg version`
pub const FIRMWARE_LABELS: &[(&str, &str)] = &[
    ("Application", "application"),
    ("Bootloader", "bootloader"),
    ("Radio", "radio"),
];

fn label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([^:]+?)\s*:\s*(.*?)\s*$").expect("label pattern is valid"))
}

fn progress_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"->\s*Lines:\s*(\d+)").expect("progress pattern is valid"))
}

/// Collect the values of every known label in `lines`
///
/// Unknown labels and lines without a colon are skipped. A label with an
/// empty value is treated as absent. When a label repeats, the last one wins.
pub fn parse_labeled<S: AsRef<str>>(
    lines: &[S],
    table: &[(&str, &'static str)],
) -> HashMap<&'static str, String> {
    let mut fields = HashMap::new();

    for line in lines {
        let Some(caps) = label_regex().captures(line.as_ref()) else {
            continue;
        };
        let label = &caps[1];
        let value = &caps[2];
        if value.is_empty() {
            continue;
        }
        if let Some((_, key)) = table.iter().find(|(known, _)| known.eq_ignore_ascii_case(label)) {
            fields.insert(*key, value.to_string());
        }
    }

    fields
}

pub fn parse_product_details<S: AsRef<str>>(lines: &[S]) -> ProductDetails {
    let mut fields = parse_labeled(lines, PRODUCT_LABELS);
    ProductDetails {
        product_name: fields.remove("product_name"),
        model_number: fields.remove("model_number"),
        serial_number: fields.remove("serial_number"),
        hardware_revision: fields.remove("hardware_revision"),
        firmware_version: fields.remove("firmware_version"),
    }
}

pub fn parse_firmware_versions<S: AsRef<str>>(lines: &[S]) -> FirmwareVersions {
    let mut fields = parse_labeled(lines, FIRMWARE_LABELS);
    FirmwareVersions {
        application: fields.remove("application"),
        bootloader: fields.remove("bootloader"),
        radio: fields.remove("radio"),
    }
}

/// One device id per non-empty line
pub fn parse_device_list<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    lines
        .iter()
        .map(|line| line.as_ref().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Last `-> Lines: <n>` counter in a streamed chunk
pub fn parse_progress_lines(chunk: &str) -> Option<u64> {
    progress_regex()
        .captures_iter(chunk)
        .filter_map(|caps| caps[1].parse().ok())
        .last()
}

/// Convert a line counter to a whole percentage, capped at 100
pub fn progress_percent(lines: u64, total_lines: u64) -> u8 {
    if total_lines == 0 {
        return 0;
    }
    (lines.saturating_mul(100) / total_lines).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_product_details() {
        let lines = [
            "Product Name: Beacon One",
            "Serial Number :  SN-0042 ",
            "Unrelated: ignored",
            "garbage line",
        ];
        let details = parse_product_details(&lines);
        assert_eq!(details.product_name.as_deref(), Some("Beacon One"));
        assert_eq!(details.serial_number.as_deref(), Some("SN-0042"));
        assert_eq!(details.model_number, None);
        assert_eq!(details.hardware_revision, None);
    }

    #[test]
    fn test_empty_value_is_absent() {
        let details = parse_product_details(&["Model Number:", "Hardware Revision: C"]);
        assert_eq!(details.model_number, None);
        assert_eq!(details.hardware_revision.as_deref(), Some("C"));
    }

    #[test]
    fn test_parse_firmware_versions() {
        let lines = vec![
            "mfg version".to_string(),
            "Application: 2.1.0".to_string(),
            "bootloader: 1.0.4".to_string(),
        ];
        let versions = parse_firmware_versions(&lines);
        assert_eq!(versions.application.as_deref(), Some("2.1.0"));
        assert_eq!(versions.bootloader.as_deref(), Some("1.0.4"));
        assert_eq!(versions.radio, None);
    }

    #[test]
    fn test_parse_device_list_skips_blank_lines() {
        let devices = parse_device_list(&["  /dev/ttyACM0 ", "", "/dev/ttyACM1"]);
        assert_eq!(devices, vec!["/dev/ttyACM0", "/dev/ttyACM1"]);
    }

    #[test]
    fn test_progress_takes_last_counter_in_chunk() {
        assert_eq!(parse_progress_lines("-> Lines: 15000"), Some(15000));
        assert_eq!(
            parse_progress_lines("-> Lines: 100\nwriting\n-> Lines: 200"),
            Some(200)
        );
        assert_eq!(parse_progress_lines("Erasing flash"), None);
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(15000, 30000), 50);
        assert_eq!(progress_percent(45000, 30000), 100);
        assert_eq!(progress_percent(10, 0), 0);
    }
}
