//! Release extractor
//!
//! Talks to the UniProt mirror: resumable downloads of the compressed
//! XML corpora, MD5 verification against the published manifest, and
//! release metadata from the mirror's notes files.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::settings::SourceUrls;

/// Parsed release metadata from the mirror's notes files.
#[derive(Debug, Clone)]
pub struct ReleaseInfo {
    pub version: String,
    pub date: Option<NaiveDate>,
    pub swissprot_entry_count: i64,
    pub trembl_entry_count: i64,
}

pub struct Extractor {
    client: reqwest::Client,
    sources: SourceUrls,
    data_dir: PathBuf,
    checksums: Option<HashMap<String, String>>,
}

impl Extractor {
    pub fn new(sources: SourceUrls, data_dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            sources,
            data_dir,
            checksums: None,
        }
    }

    /// Download one corpus file, resuming a partial download when the
    /// server supports range requests. Returns the local path.
    pub async fn download_file(&self, filename: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.data_dir)?;
        let url = format!("{}{}", self.sources.base_url, filename);
        let local_path = self.data_dir.join(filename);

        let mut downloaded = if local_path.exists() {
            std::fs::metadata(&local_path)?.len()
        } else {
            0
        };

        let mut request = self.client.get(&url);
        if downloaded > 0 {
            info!(file = filename, offset = downloaded, "resuming download");
            request = request.header(RANGE, format!("bytes={downloaded}-"));
        }
        let response = request.send().await?.error_for_status()?;

        let mut file = match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&local_path)
                    .await?
            }
            _ => {
                downloaded = 0;
                tokio::fs::File::create(&local_path).await?
            }
        };

        let total = response.content_length().map(|len| len + downloaded);
        let bar = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .expect("progress template is valid")
            .progress_chars("##-"),
        );
        bar.set_message(filename.to_string());
        bar.set_position(downloaded);

        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            bar.inc(chunk.len() as u64);
        }
        file.flush().await?;
        bar.finish_with_message(format!("{filename} done"));

        info!(file = filename, path = %local_path.display(), "download complete");
        Ok(local_path)
    }

    /// Fetch and parse the MD5 manifest. A missing manifest disables
    /// verification with a warning instead of failing the download.
    pub async fn fetch_checksums(&mut self) -> Result<&HashMap<String, String>> {
        if self.checksums.is_none() {
            let url = format!("{}{}", self.sources.base_url, self.sources.checksums_file);
            let response = self.client.get(&url).send().await?;
            let map = if response.status() == StatusCode::NOT_FOUND {
                warn!(%url, "checksum manifest not found, skipping verification");
                HashMap::new()
            } else {
                parse_checksums(&response.error_for_status()?.text().await?)
            };
            info!(checksums = map.len(), "checksum manifest loaded");
            self.checksums = Some(map);
        }
        Ok(self.checksums.as_ref().expect("checksums just populated"))
    }

    /// Verify a downloaded file against the manifest. Files without a
    /// published checksum pass with a warning.
    pub async fn verify_checksum(&mut self, path: &Path) -> Result<bool> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("download path has no file name")?
            .to_string();
        let expected = self.fetch_checksums().await?.get(&filename).cloned();
        let Some(expected) = expected else {
            warn!(file = %filename, "no published checksum, skipping verification");
            return Ok(true);
        };

        let path = path.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || -> Result<String> {
            let mut file = std::fs::File::open(&path)?;
            let mut context = md5::Context::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                context.consume(&buf[..n]);
            }
            Ok(format!("{:x}", context.compute()))
        })
        .await??;

        if actual == expected {
            info!(file = %filename, "checksum verified");
            Ok(true)
        } else {
            warn!(file = %filename, %expected, %actual, "checksum mismatch");
            Ok(false)
        }
    }

    /// Release version, date and entry counts from the mirror notes.
    pub async fn release_info(&self) -> Result<ReleaseInfo> {
        let reldate_url = format!(
            "{}{}",
            self.sources.base_url, self.sources.release_notes_file
        );
        let reldate = self
            .client
            .get(&reldate_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let (version, date) = parse_reldate(&reldate)
            .with_context(|| format!("could not parse release info from {reldate_url}"))?;

        let counts = match self.client.get(&self.sources.relnotes_url).send().await {
            Ok(response) => response
                .text()
                .await
                .ok()
                .and_then(|text| parse_entry_counts(&text)),
            Err(err) => {
                warn!(error = %err, "could not fetch release statistics");
                None
            }
        };
        let (swissprot, trembl) = counts.unwrap_or((0, 0));

        Ok(ReleaseInfo {
            version,
            date,
            swissprot_entry_count: swissprot,
            trembl_entry_count: trembl,
        })
    }
}

fn parse_checksums(manifest: &str) -> HashMap<String, String> {
    let line_re = Regex::new(r"^\s*([a-f0-9]{32})\s+([\w.\-]+\.gz)\s*$").expect("regex is valid");
    manifest
        .lines()
        .filter_map(|line| {
            line_re
                .captures(line)
                .map(|caps| (caps[2].to_string(), caps[1].to_string()))
        })
        .collect()
}

fn parse_reldate(text: &str) -> Option<(String, Option<NaiveDate>)> {
    let re = Regex::new(r"Release\s+(\S+)\s+of\s+(\S+)").expect("regex is valid");
    let caps = re.captures(text)?;
    let version = caps[1].to_string();
    let date = NaiveDate::parse_from_str(&caps[2], "%d-%b-%Y").ok();
    Some((version, date))
}

fn parse_entry_counts(text: &str) -> Option<(i64, i64)> {
    let re = Regex::new(
        r"UniProtKB/Swiss-Prot:\s+([\d,]+)\s+entries and UniProtKB/TrEMBL:\s+([\d,]+)\s+entries",
    )
    .expect("regex is valid");
    let caps = re.captures(text)?;
    let parse = |s: &str| s.replace(',', "").parse::<i64>().ok();
    Some((parse(&caps[1])?, parse(&caps[2])?))
}

/// Guard against mixing releases: the downloaded version must match any
/// already-configured release tag.
pub fn check_release_consistency(configured: Option<&str>, downloaded: &str) -> Result<()> {
    if let Some(configured) = configured {
        if configured != downloaded {
            bail!(
                "configured release tag '{configured}' does not match mirror release '{downloaded}'"
            );
        }
    }
    Ok(())
}
