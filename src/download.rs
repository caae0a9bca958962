use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::progress::{ProgressRange, ProgressReporter};

/// Streams a diff artifact to disk, block by block.
///
/// Every call is a fresh download: an existing file at the destination is
/// truncated, never resumed. On failure the destination may hold a partial
/// file that callers must not trust.
#[derive(Debug, Clone)]
pub struct Downloader {
    agent: ureq::Agent,
    block_size: usize,
}

impl Downloader {
    pub fn new(config: &UpdaterConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout_read(config.read_timeout)
            .user_agent(&config.user_agent)
            .build();
        Self {
            agent,
            block_size: config.block_size.max(1),
        }
    }

    /// Download `url` to `dest`, reporting into `range` of the overall bar.
    /// `file://` URLs are streamed from the local filesystem.
    ///
    /// Returns the number of bytes written.
    pub fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressReporter,
        range: ProgressRange,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        tracing::info!(url, dest = %dest.display(), "downloading diff artifact");

        let (reader, total) = match url.strip_prefix("file://") {
            Some(local) => open_local(url, Path::new(local))?,
            None => self.open_http(url)?,
        };

        let written = self.stream_to_file(reader, total, dest, progress, range, cancel)?;
        tracing::info!(url, bytes = written, "download complete");
        Ok(written)
    }

    fn open_http(&self, url: &str) -> Result<(Box<dyn Read + Send>, Option<u64>)> {
        let response = match self.agent.get(url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(UpdateError::Network(format!("HTTP {code} for {url}")));
            }
            Err(e) => return Err(UpdateError::Network(format!("request to {url} failed: {e}"))),
        };

        if !(200..300).contains(&response.status()) {
            return Err(UpdateError::Network(format!(
                "HTTP {} for {url}",
                response.status()
            )));
        }

        let total = response
            .header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let reader: Box<dyn Read + Send> = response.into_reader();
        Ok((reader, total))
    }

    fn stream_to_file(
        &self,
        mut reader: Box<dyn Read + Send>,
        total: Option<u64>,
        dest: &Path,
        progress: &ProgressReporter,
        range: ProgressRange,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut file = File::create(dest).map_err(|e| UpdateError::io(dest, e))?;
        let mut buf = vec![0u8; self.block_size];
        let mut written: u64 = 0;

        progress.report("Downloading", range.scale(0.0), "starting");
        loop {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(UpdateError::Network(format!("read failed: {e}"))),
            };
            file.write_all(&buf[..n]).map_err(|e| UpdateError::io(dest, e))?;
            written += n as u64;

            let (fraction, detail) = match total {
                Some(total) if total > 0 => (
                    written as f64 / total as f64,
                    format!("{} / {}", format_bytes(written), format_bytes(total)),
                ),
                _ => (0.0, format_bytes(written)),
            };
            progress.report("Downloading", range.scale(fraction), detail);
        }
        file.flush().map_err(|e| UpdateError::io(dest, e))?;

        if let Some(total) = total {
            if written != total {
                return Err(UpdateError::Network(format!(
                    "connection closed after {written} of {total} bytes"
                )));
            }
        }
        Ok(written)
    }
}

fn open_local(url: &str, path: &Path) -> Result<(Box<dyn Read + Send>, Option<u64>)> {
    let file =
        File::open(path).map_err(|e| UpdateError::Network(format!("cannot open {url}: {e}")))?;
    let len = file.metadata().ok().map(|m| m.len());
    let reader: Box<dyn Read + Send> = Box::new(file);
    Ok((reader, len))
}

/// Human-readable byte count, e.g. `1.5 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
