/// Firmware package manifest reader
///
/// Manifests are small XML documents downloaded next to the index:
///
/// ```xml
/// <package name="beacon" date="2024-05-02">
///   <notes>Fixes radio wake-up</notes>
///   <component name="application" version="2.1.0" location="fw/app.bin"/>
/// </package>
/// ```
///
/// Missing or malformed sections leave the matching fields empty.

use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed manifest XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("Manifest has no <package> element")]
    MissingPackage,
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// One installable image in a package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub version: Option<String>,
    /// Object key of the image in the repository
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub name: Option<String>,
    pub release_date: Option<String>,
    pub release_notes: Option<String>,
    pub components: Vec<Component>,
}

impl PackageManifest {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut reader = Reader::from_str(raw);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();

        let mut manifest: Option<PackageManifest> = None;
        let mut in_notes = false;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(element) => match element.name().as_ref() {
                    b"package" => manifest = Some(package_from(&element)),
                    b"notes" => in_notes = manifest.is_some(),
                    b"component" => push_component(manifest.as_mut(), &element),
                    _ => {}
                },
                Event::Empty(element) => match element.name().as_ref() {
                    b"package" => manifest = Some(package_from(&element)),
                    b"component" => push_component(manifest.as_mut(), &element),
                    _ => {}
                },
                Event::Text(text) if in_notes => {
                    let notes = text
                        .unescape()
                        .map(|notes| notes.trim().to_string())
                        .unwrap_or_else(|_| String::from_utf8_lossy(text.as_ref()).trim().to_string());
                    if let Some(manifest) = manifest.as_mut() {
                        if !notes.is_empty() {
                            manifest.release_notes = Some(notes);
                        }
                    }
                }
                Event::End(element) if element.name().as_ref() == b"notes" => in_notes = false,
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        manifest.ok_or(ManifestError::MissingPackage)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Newest readable manifest in `dir` with the given extension
    ///
    /// Manifests are ordered by release date; undated ones sort first.
    /// Unreadable files are logged and skipped.
    pub fn latest_in(dir: &Path, extension: &str) -> Option<(PathBuf, PackageManifest)> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("No manifest cache at {}: {}", dir.display(), e);
                return None;
            }
        };

        entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.to_string_lossy().ends_with(extension))
            .filter_map(|path| match Self::load(&path) {
                Ok(manifest) => Some((path, manifest)),
                Err(e) => {
                    log::warn!("Skipping manifest {}: {}", path.display(), e);
                    None
                }
            })
            .max_by(|(_, a), (_, b)| a.release_date.cmp(&b.release_date))
    }

    /// Components that name a repository location
    pub fn locations(&self) -> Vec<String> {
        self.components
            .iter()
            .filter_map(|component| component.location.clone())
            .collect()
    }
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .with_checks(false)
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .and_then(|attr| {
            attr.unescape_value()
                .ok()
                .map(|value| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
}

fn package_from(element: &BytesStart<'_>) -> PackageManifest {
    PackageManifest {
        name: attribute(element, b"name"),
        release_date: attribute(element, b"date"),
        ..Default::default()
    }
}

fn push_component(manifest: Option<&mut PackageManifest>, element: &BytesStart<'_>) {
    let Some(manifest) = manifest else {
        return;
    };
    let Some(name) = attribute(element, b"name") else {
        log::warn!("Manifest component without a name ignored");
        return;
    };
    manifest.components.push(Component {
        name,
        version: attribute(element, b"version"),
        location: attribute(element, b"location"),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"<?xml version="1.0"?>
<package name="beacon" date="2024-05-02">
  <notes>Fixes radio &amp; wake-up</notes>
  <component name="bootloader" version="1.0.4" location="fw/2024/boot.bin"/>
  <component name="application" version="2.1.0" location="fw/2024/app.bin"></component>
  <component version="9.9"/>
</package>"#;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = PackageManifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.name.as_deref(), Some("beacon"));
        assert_eq!(manifest.release_date.as_deref(), Some("2024-05-02"));
        assert_eq!(manifest.release_notes.as_deref(), Some("Fixes radio & wake-up"));
        assert_eq!(manifest.components.len(), 2);
        assert_eq!(manifest.components[1].name, "application");
        assert_eq!(manifest.components[1].version.as_deref(), Some("2.1.0"));
        assert_eq!(manifest.locations(), vec!["fw/2024/boot.bin", "fw/2024/app.bin"]);
    }

    #[test]
    fn test_missing_sections_stay_absent() {
        let manifest = PackageManifest::parse(r#"<package name="bare"/>"#).unwrap();
        assert_eq!(manifest.name.as_deref(), Some("bare"));
        assert_eq!(manifest.release_date, None);
        assert_eq!(manifest.release_notes, None);
        assert!(manifest.components.is_empty());
    }

    #[test]
    fn test_non_package_document_is_rejected() {
        assert!(matches!(
            PackageManifest::parse("<index><entry/></index>"),
            Err(ManifestError::MissingPackage)
        ));
    }

    #[test]
    fn test_latest_in_picks_newest_release() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.xml"), r#"<package name="old" date="2023-01-01"/>"#).unwrap();
        std::fs::write(dir.path().join("new.xml"), r#"<package name="new" date="2024-06-30"/>"#).unwrap();
        std::fs::write(dir.path().join("broken.xml"), "<index/>").unwrap();
        std::fs::write(dir.path().join("app.bin"), [0u8, 1, 2]).unwrap();

        let (path, manifest) = PackageManifest::latest_in(dir.path(), ".xml").unwrap();
        assert_eq!(manifest.name.as_deref(), Some("new"));
        assert_eq!(path, dir.path().join("new.xml"));
    }

    #[test]
    fn test_latest_in_missing_dir() {
        assert!(PackageManifest::latest_in(Path::new("/nonexistent/cache"), ".xml").is_none());
    }
}
