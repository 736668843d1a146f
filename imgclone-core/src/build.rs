//! Recreates the source's partitions and file systems on the destination
//! device.
//!
//! Partitions are processed in ordinal order. For each one the table entry is
//! created, the source's file system UUID, label and disk identifier are
//! looked up, the file system is made (retrying once without the UUID), the
//! label is applied and the disk identifier written.
use crate::device::partition_path;
use crate::error::{CloneError, SpanKind, ToolError};
use crate::partition::PartitionDescriptor;
use crate::tools::{BlockProbe, Formatter, PartitionEnd, PartitionRequest, PartitionTool};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Source metadata resolved for one partition. Each field is independently
/// optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedMetadata {
    /// File system UUID, or an 8-hex-digit FAT volume ID without hyphen.
    pub fs_uuid: Option<String>,
    pub label: Option<String>,
    /// The source disk's partition table identifier.
    pub disk_id: Option<String>,
}

/// Validates a file system identifier as reported by the block probe.
///
/// A 9-character value is a FAT volume ID (`ABCD-1234`) and must have its
/// hyphen at index 4, which is removed. A 36-character value is a UUID and
/// must have hyphens at 8, 13, 18 and 23. Anything else is rejected.
pub fn sanitize_fs_uuid(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    match bytes.len() {
        9 if bytes[4] == b'-' => Some(format!("{}{}", &raw[..4], &raw[5..])),
        36 if [8, 13, 18, 23].iter().all(|&i| bytes[i] == b'-') => Some(raw.to_string()),
        _ => None,
    }
}

/// Validates an msdos disk identifier: exactly 8 hex digits, an optional
/// `0x` prefix is accepted and dropped.
pub fn sanitize_disk_id(raw: &str) -> Option<String> {
    let id = raw.strip_prefix("0x").unwrap_or(raw);
    (id.len() == 8 && id.chars().all(|c| c.is_ascii_hexdigit())).then(|| id.to_ascii_lowercase())
}

/// Clears the destination device and writes an empty msdos label.
pub fn prepare_device<T: PartitionTool + ?Sized>(
    tool: &T,
    device: &Path,
) -> Result<(), CloneError> {
    tool.wipe(device)
        .map_err(|source| CloneError::DeviceWipeFailed {
            device: device.to_path_buf(),
            source,
        })?;
    tool.make_label(device)
        .map_err(|source| CloneError::TableCreateFailed {
            device: device.to_path_buf(),
            source,
        })
}

/// Where partition `index` of `parts` should end on the destination.
///
/// Extended containers and the last non-extended partition run to the end of
/// the device; every other partition keeps its source end sector.
pub fn span_of(parts: &[PartitionDescriptor], index: usize) -> (PartitionEnd, SpanKind) {
    let part = &parts[index];
    let last_data = parts.iter().rposition(|p| !p.is_extended());
    if part.is_extended() {
        (PartitionEnd::DeviceEnd, SpanKind::Extended)
    } else if last_data == Some(index) {
        (PartitionEnd::DeviceEnd, SpanKind::ToEnd)
    } else {
        (PartitionEnd::Sector(part.end), SpanKind::Exact)
    }
}

/// Recreates every partition of `parts` on `device`.
///
/// `disk_id` is the identifier to stamp on the destination table when the
/// caller wants a fresh one; otherwise the source's is copied when known.
/// Returns the metadata resolved per ordinal.
pub fn run<H>(
    host: &H,
    source: &Path,
    device: &Path,
    parts: &[PartitionDescriptor],
    disk_id: Option<&str>,
) -> Result<BTreeMap<u32, ResolvedMetadata>, CloneError>
where
    H: PartitionTool + BlockProbe + Formatter + ?Sized,
{
    let mut resolved = BTreeMap::new();
    for index in 0..parts.len() {
        let meta = build_partition(host, source, device, parts, index, disk_id)?;
        resolved.insert(parts[index].ordinal, meta);
    }
    info!("{} partitions created", parts.len());
    Ok(resolved)
}

fn build_partition<H>(
    host: &H,
    source: &Path,
    device: &Path,
    parts: &[PartitionDescriptor],
    index: usize,
    disk_id: Option<&str>,
) -> Result<ResolvedMetadata, CloneError>
where
    H: PartitionTool + BlockProbe + Formatter + ?Sized,
{
    let part = &parts[index];
    let (end, span) = span_of(parts, index);
    let request = PartitionRequest {
        kind: part.kind,
        filesystem: if part.is_extended() {
            String::new()
        } else {
            part.filesystem.clone()
        },
        start: part.start,
        end,
    };
    info!("creating {} partition {} ({:?})", part.kind, part.ordinal, span);
    host.make_partition(device, &request)
        .map_err(|source| CloneError::PartitionCreateFailed {
            ordinal: part.ordinal,
            kind: part.kind,
            span,
            source,
        })?;

    if let Err(e) = host.refresh() {
        warn!("partprobe failed: {e}");
    }

    let meta = resolve_metadata(host, source, part.ordinal);
    debug!("partition {} source metadata: {:?}", part.ordinal, meta);

    let target = partition_path(device, part.ordinal);
    if let Some(format) = part.format() {
        let uuid = meta.fs_uuid.as_deref();
        let made = match (host.format(format, &target, uuid), uuid) {
            (Ok(()), _) => Ok(()),
            // The id itself may be what the formatter refused.
            (Err(e), Some(id)) => {
                warn!(
                    "could not create {format} on {} with id {id}: {e}, retrying without it",
                    target.display()
                );
                host.format(format, &target, None).map_err(|e| (e, true))
            }
            (Err(e), None) => Err((e, false)),
        };
        made.map_err(|(source, retried)| CloneError::FilesystemCreateFailed {
            ordinal: part.ordinal,
            format,
            retried,
            source,
        })?;

        if let Some(label) = &meta.label {
            if let Err(e) = host.set_label(format, &target, label) {
                warn!("could not label {} as {label}: {e}", target.display());
            }
        }
    }

    if let Some(id) = disk_id.or(meta.disk_id.as_deref()) {
        host.write_disk_id(device, id)
            .map_err(|source| CloneError::DiskIdWriteFailed {
                device: device.to_path_buf(),
                disk_id: id.to_string(),
                source,
            })?;
    }

    Ok(meta)
}

fn resolve_metadata<P: BlockProbe + ?Sized>(
    probe: &P,
    source: &Path,
    ordinal: u32,
) -> ResolvedMetadata {
    let partition = partition_path(source, ordinal);
    let lookup = |what: &str, result: Result<Option<String>, ToolError>| match result {
        Ok(value) => value.filter(|v: &String| !v.is_empty()),
        Err(e) => {
            warn!("could not read {what} of {}: {e}", partition.display());
            None
        }
    };

    let fs_uuid = lookup("uuid", probe.filesystem_uuid(&partition));
    let fs_uuid = match fs_uuid {
        Some(raw) => {
            let clean = sanitize_fs_uuid(&raw);
            if clean.is_none() {
                warn!("ignoring malformed file system id {raw}");
            }
            clean
        }
        None => None,
    };
    let label = lookup("label", probe.filesystem_label(&partition));
    let disk_id = lookup("disk id", probe.disk_id(source)).and_then(|raw| sanitize_disk_id(&raw));

    ResolvedMetadata {
        fs_uuid,
        label,
        disk_id,
    }
}
