//! Processed guide output.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::atomic::write_atomic;
use crate::layout::channel_file_stem;

/// Files written for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedOutput {
    /// `processed/<stem>.xml`.
    pub xml: PathBuf,
    /// `processed/<stem>.xml.gz`, when compression was requested.
    pub gzip: Option<PathBuf>,
}

/// Processed guide directory.
#[derive(Debug, Clone)]
pub struct ProcessedArea {
    dir: PathBuf,
}

fn gzip_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("failed to compress guide")?;
    encoder.finish().context("failed to finish gzip stream")
}

impl ProcessedArea {
    /// Creates the area rooted at `dir`.
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Path of a channel's processed XML.
    #[must_use]
    pub fn xml_path(&self, channel_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.xml", channel_file_stem(channel_id)))
    }

    /// Atomically replaces a channel's processed guide.
    ///
    /// When `gzip` is set a compressed copy is written beside it. The XML is
    /// replaced last, so a failed compression or `.gz` write leaves the
    /// previous guide in place.
    ///
    /// # Errors
    ///
    /// Returns an error if compression or a write fails.
    pub fn write(&self, channel_id: &str, xml: &str, gzip: bool) -> Result<ProcessedOutput> {
        let xml_path = self.xml_path(channel_id);

        let gzip_path = if gzip {
            let compressed = gzip_bytes(xml.as_bytes())?;
            let mut name = xml_path.clone().into_os_string();
            name.push(".gz");
            let path = PathBuf::from(name);
            write_atomic(&path, &compressed)?;
            Some(path)
        } else {
            None
        };

        write_atomic(&xml_path, xml.as_bytes())?;

        tracing::debug!(
            channel = channel_id,
            path = %xml_path.display(),
            bytes = xml.len(),
            gzip = gzip_path.is_some(),
            "Processed guide written"
        );

        Ok(ProcessedOutput {
            xml: xml_path,
            gzip: gzip_path,
        })
    }
}
