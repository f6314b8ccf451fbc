//! `inspect` command: describe a hex image without touching any robot.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::upgrade::{parse_file, FirmwareImage, RecordKind};

/// Information about a firmware image.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    /// Image file.
    pub path: String,
    /// Number of records, end-of-file included.
    pub records: usize,
    /// Number of data records.
    pub data_records: usize,
    /// Number of data bytes.
    pub data_bytes: usize,
    /// Lowest data address.
    pub span_start: Option<u32>,
    /// One past the highest data address.
    pub span_end: Option<u32>,
    /// Entry point, when the image declares one.
    pub start_address: Option<u32>,
    /// SHA-256 of the data bytes in address order.
    pub sha256: String,
}

impl ImageSummary {
    pub fn new(path: &Path, image: &FirmwareImage) -> Self {
        let span = image.span();
        Self {
            path: path.display().to_string(),
            records: image.records().len(),
            data_records: image.data_records().count(),
            data_bytes: image.data_len(),
            span_start: span.as_ref().map(|s| s.start),
            span_end: span.as_ref().map(|s| s.end),
            start_address: image.start_address(),
            sha256: image.sha256(),
        }
    }
}

fn print_records(image: &FirmwareImage) {
    for record in image.records() {
        match record.kind {
            RecordKind::Data => println!(
                "  data      0x{:08X}..0x{:08X}  {} bytes",
                record.address,
                record.range().end,
                record.data.len()
            ),
            RecordKind::ExtendedAddress => println!("  base      0x{:08X}", record.address),
            RecordKind::StartAddress => println!("  entry     0x{:08X}", record.address),
            RecordKind::EndOfFile => println!("  end of file"),
        }
    }
}

/// Parse an image and print what it contains.
pub async fn run(path: PathBuf, json: bool, normalized: bool) -> Result<(), String> {
    let (path, image) = tokio::task::spawn_blocking(move || {
        let image = parse_file(&path);
        (path, image)
    })
    .await
    .map_err(|e| format!("Inspection failed: {}", e))?;
    let image = image.map_err(|e| e.user_message())?;

    if normalized {
        print!("{}", image.to_hex_string());
        return Ok(());
    }

    let summary = ImageSummary::new(&path, &image);
    if json {
        let text = serde_json::to_string_pretty(&summary)
            .map_err(|e| format!("Failed to serialize summary: {}", e))?;
        println!("{}", text);
        return Ok(());
    }

    println!("{}", summary.path);
    print_records(&image);
    match (summary.span_start, summary.span_end) {
        (Some(start), Some(end)) => println!("span:    0x{:08X}..0x{:08X}", start, end),
        _ => println!("span:    (no data)"),
    }
    println!("size:    {} bytes", summary.data_bytes);
    println!("sha256:  {}", summary.sha256);
    Ok(())
}
