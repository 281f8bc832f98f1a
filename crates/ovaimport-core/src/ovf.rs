//! OVF descriptor parsing.
//!
//! Locates the single `.ovf` descriptor in an extracted appliance and derives
//! what provisioning needs from it: the firmware kind and the ordered list of
//! disk images present alongside it.

use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};

/// File extensions recognised as disk images (compared case-insensitively).
pub const DISK_IMAGE_EXTENSIONS: &[&str] = &["vmdk", "img", "raw", "qcow2", "vhd", "vhdx"];

/// Firmware the appliance boots with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirmwareKind {
    /// Legacy BIOS boot.
    #[default]
    Bios,
    /// UEFI boot.
    Uefi,
}

impl FirmwareKind {
    /// Map the text of the descriptor's `Firmware` element.
    ///
    /// Only the exact text `EFI` selects UEFI; anything else, or a missing
    /// element, means BIOS.
    pub fn from_element_text(text: Option<&str>) -> Self {
        match text {
            Some("EFI") => FirmwareKind::Uefi,
            _ => FirmwareKind::Bios,
        }
    }

    /// The `machineTypeKeyword` value understood by the management API.
    pub fn machine_type_keyword(self) -> &'static str {
        match self {
            FirmwareKind::Bios => "bios",
            FirmwareKind::Uefi => "uefi",
        }
    }
}

impl std::fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirmwareKind::Bios => write!(f, "BIOS"),
            FirmwareKind::Uefi => write!(f, "UEFI"),
        }
    }
}

/// A disk image file found in the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    /// File name, as sent to the upload endpoint.
    pub name: String,
    /// Absolute path of the image.
    pub path: PathBuf,
}

/// Parsed view of an appliance descriptor. Immutable once built.
#[derive(Debug, Clone)]
pub struct ApplianceDescriptor {
    /// Path of the `.ovf` file that was parsed.
    pub descriptor_path: PathBuf,
    /// Firmware kind from the `Firmware` element.
    pub firmware: FirmwareKind,
    /// Disk images in transfer order.
    pub disks: Vec<DiskImage>,
}

/// Fields extracted from descriptor XML.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OvfContent {
    /// Text of the first `Firmware` element, if any.
    pub firmware_text: Option<String>,
    /// `href` of each `References/File` element, in document order.
    pub file_refs: Vec<String>,
}

/// Parse the appliance extracted into `work_dir`.
///
/// # Errors
///
/// - [`Error::DescriptorNotFound`] / [`Error::AmbiguousDescriptor`] unless
///   exactly one `.ovf` file exists.
/// - [`Error::DescriptorParse`] if the descriptor is not well-formed.
pub fn parse_appliance(work_dir: &Path) -> Result<ApplianceDescriptor> {
    let files = scan_files(work_dir)?;
    let descriptor_path = locate_descriptor(work_dir, &files)?;

    let bytes = fs::read(&descriptor_path).map_err(|e| Error::io(e, &descriptor_path))?;
    let xml = String::from_utf8(bytes)
        .map_err(|e| Error::descriptor_parse(format!("descriptor is not valid UTF-8: {e}")))?;
    let content = parse_ovf_xml(&xml)?;
    let firmware = FirmwareKind::from_element_text(content.firmware_text.as_deref());
    let disks = order_disks(work_dir, &files, &content.file_refs);

    tracing::info!(
        descriptor = %descriptor_path.display(),
        %firmware,
        disks = disks.len(),
        "parsed appliance descriptor"
    );

    Ok(ApplianceDescriptor {
        descriptor_path,
        firmware,
        disks,
    })
}

/// List every regular file under `root`, relative to it, in lexical order.
///
/// Walks with an explicit worklist instead of recursion.
pub fn scan_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).map_err(|e| Error::io(e, &dir))? {
            let entry = entry.map_err(|e| Error::io(e, &dir))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| Error::io(e, &path))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    files.push(relative.to_path_buf());
                }
            }
        }
    }

    files.sort();
    Ok(files)
}

fn locate_descriptor(root: &Path, files: &[PathBuf]) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = files
        .iter()
        .filter(|f| has_extension(f, &["ovf"]))
        .map(|f| root.join(f))
        .collect();

    match candidates.len() {
        0 => Err(Error::DescriptorNotFound {
            dir: root.to_path_buf(),
        }),
        1 => Ok(candidates.remove(0)),
        _ => Err(Error::AmbiguousDescriptor { candidates }),
    }
}

/// Parse descriptor XML, extracting the firmware text and file references.
pub fn parse_ovf_xml(xml: &str) -> Result<OvfContent> {
    let mut reader = Reader::from_str(xml);
    let mut content = OvfContent::default();

    let mut depth = 0usize;
    let mut seen_root = false;
    let mut root_closed = false;
    let mut references_depth: Option<usize> = None;
    let mut firmware_buf: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if root_closed {
                    return Err(content_after_root());
                }
                depth += 1;
                seen_root = true;
                match e.local_name().as_ref() {
                    b"References" => references_depth = Some(depth),
                    b"Firmware" if content.firmware_text.is_none() => {
                        firmware_buf = Some(String::new());
                    }
                    b"File" if references_depth == Some(depth - 1) => {
                        push_file_ref(e, &mut content)?;
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                if root_closed {
                    return Err(content_after_root());
                }
                if depth == 0 {
                    root_closed = true;
                }
                seen_root = true;
                match e.local_name().as_ref() {
                    b"Firmware" if content.firmware_text.is_none() => {
                        content.firmware_text = Some(String::new());
                    }
                    b"File" if references_depth == Some(depth) => {
                        push_file_ref(e, &mut content)?;
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref t)) => {
                if root_closed && !t.iter().all(u8::is_ascii_whitespace) {
                    return Err(content_after_root());
                }
                if let Some(buf) = firmware_buf.as_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::descriptor_parse(e.to_string()))?;
                    buf.push_str(&text);
                }
            }
            Ok(Event::CData(ref t)) => {
                if root_closed {
                    return Err(content_after_root());
                }
                if let Some(buf) = firmware_buf.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(t));
                }
            }
            Ok(Event::End(ref e)) => {
                match e.local_name().as_ref() {
                    b"Firmware" => {
                        if let Some(text) = firmware_buf.take() {
                            content.firmware_text = Some(text);
                        }
                    }
                    b"References" if references_depth == Some(depth) => {
                        references_depth = None;
                    }
                    _ => {}
                }
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    root_closed = true;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::descriptor_parse(format!(
                    "at byte {}: {e}",
                    reader.error_position()
                )));
            }
        }
    }

    if !seen_root {
        return Err(Error::descriptor_parse("document has no root element"));
    }
    if depth != 0 {
        return Err(Error::descriptor_parse("unexpected end of document"));
    }

    Ok(content)
}

fn content_after_root() -> Error {
    Error::descriptor_parse("content after root element")
}

fn push_file_ref(e: &BytesStart<'_>, content: &mut OvfContent) -> Result<()> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::descriptor_parse(e.to_string()))?;
        if attr.key.local_name().as_ref() == b"href" {
            let href = attr
                .unescape_value()
                .map_err(|e| Error::descriptor_parse(e.to_string()))?;
            content.file_refs.push(href.into_owned());
        }
    }
    Ok(())
}

/// Order present disk images: declared references first, the rest by name.
///
/// Only files at the top of the working directory are considered.
fn order_disks(root: &Path, files: &[PathBuf], file_refs: &[String]) -> Vec<DiskImage> {
    let mut remaining: Vec<&PathBuf> = files
        .iter()
        .filter(|f| f.components().count() == 1)
        .filter(|f| has_extension(f, DISK_IMAGE_EXTENSIONS))
        .collect();

    let mut ordered = Vec::with_capacity(remaining.len());
    for href in file_refs {
        if let Some(pos) = remaining.iter().position(|f| f.as_path() == Path::new(href)) {
            ordered.push(remaining.remove(pos));
        }
    }
    ordered.extend(remaining);

    ordered
        .into_iter()
        .map(|relative| DiskImage {
            name: relative
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: root.join(relative),
        })
        .collect()
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|want| ext.eq_ignore_ascii_case(want)))
        .unwrap_or(false)
}
