//! Frame snapshots
//!
//! Snapshots are read back from the current draw buffer and either written
//! as numbered PNG files (`{prefix}{no:010}.png`) or, with the prefix `-`,
//! streamed to stdout as PNM, raw RGB or a content hash.

use crate::error::{ReplayError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// 8-bit image, rows top to bottom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    /// 3 (RGB) or 4 (RGBA)
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32, channels: u8, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), (width * height * channels as u32) as usize);
        Self {
            width,
            height,
            channels,
            pixels,
        }
    }

    /// Pixel data with any alpha channel dropped
    pub fn rgb(&self) -> Vec<u8> {
        if self.channels == 3 {
            return self.pixels.clone();
        }
        self.pixels
            .chunks_exact(self.channels as usize)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect()
    }

    pub fn write_png<W: Write>(&self, writer: W) -> Result<()> {
        let mut encoder = png::Encoder::new(writer, self.width, self.height);
        encoder.set_color(if self.channels == 4 {
            png::ColorType::Rgba
        } else {
            png::ColorType::Rgb
        });
        encoder.set_depth(png::BitDepth::Eight);

        let mut writer = encoder
            .write_header()
            .map_err(|e| ReplayError::Snapshot(e.to_string()))?;
        writer
            .write_image_data(&self.pixels)
            .map_err(|e| ReplayError::Snapshot(e.to_string()))?;
        Ok(())
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        self.write_png(BufWriter::new(file))
    }

    /// Binary PPM with a comment line
    pub fn write_pnm<W: Write>(&self, writer: &mut W, comment: &str) -> Result<()> {
        write!(writer, "P6\n#{}\n{} {}\n255\n", comment, self.width, self.height)?;
        writer.write_all(&self.rgb())?;
        Ok(())
    }

    pub fn write_raw<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.rgb())?;
        Ok(())
    }

    /// SHA-256 of the RGB pixel data, hex encoded
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.width.to_le_bytes());
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.rgb());
        hex::encode(hasher.finalize())
    }
}

/// Encoding used when snapshots go to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    #[default]
    Pnm,
    Rgb,
    #[value(alias = "md5")]
    Hash,
}

/// Writes snapshots as calls are replayed
pub struct Snapshotter {
    prefix: String,
    format: SnapshotFormat,
    use_call_nos: bool,
    verbose: bool,
    snapshot_no: u64,
    out: Box<dyn Write + Send>,
}

impl Snapshotter {
    pub fn new(prefix: impl Into<String>, format: SnapshotFormat, use_call_nos: bool) -> Self {
        Self::with_writer(prefix, format, use_call_nos, Box::new(std::io::stdout()))
    }

    pub fn with_writer(
        prefix: impl Into<String>,
        format: SnapshotFormat,
        use_call_nos: bool,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            format,
            use_call_nos,
            verbose: true,
            snapshot_no: 0,
            out,
        }
    }

    /// Report each written file on the output stream
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn snapshots_taken(&self) -> u64 {
        self.snapshot_no
    }

    /// File name a snapshot numbered `no` is written to
    pub fn file_name(&self, no: u64) -> String {
        format!("{}{:010}.png", self.prefix, no)
    }

    /// Store `image`, labelled with `call_no` or the running snapshot count
    pub fn take(&mut self, image: Option<Image>, call_no: u64) -> Result<()> {
        let Some(image) = image else {
            tracing::warn!(call_no, "no current context to snapshot");
            return Ok(());
        };

        let no = if self.use_call_nos {
            call_no
        } else {
            self.snapshot_no
        };

        if self.prefix == "-" {
            match self.format {
                SnapshotFormat::Pnm => image.write_pnm(&mut self.out, &no.to_string())?,
                SnapshotFormat::Rgb => image.write_raw(&mut self.out)?,
                SnapshotFormat::Hash => writeln!(self.out, "{}", image.digest())?,
            }
            self.out.flush()?;
        } else {
            let file_name = self.file_name(no);
            image.save_png(Path::new(&file_name))?;
            if self.verbose {
                writeln!(self.out, "Wrote {}", file_name)?;
            }
            tracing::debug!(call_no, file = %file_name, "snapshot written");
        }

        self.snapshot_no += 1;
        Ok(())
    }
}
