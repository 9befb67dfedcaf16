//! CLI settings loading
//!
//! Layers, lowest precedence first: built-in defaults, an optional YAML
//! file, then `UPL_*` environment variables. The pipeline portion is
//! handed to the core by value; the `sources` section only matters to the
//! downloader.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use upl_core::Settings;

/// UniProt mirror endpoints used by the `download` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceUrls {
    /// Base URL of the current-release knowledgebase directory.
    pub base_url: String,
    /// Release version/date file under `base_url`.
    pub release_notes_file: String,
    /// Checksum manifest under `base_url`.
    pub checksums_file: String,
    /// Absolute URL of the statistics notes with per-dataset entry counts.
    pub relnotes_url: String,
}

impl Default for SourceUrls {
    fn default() -> Self {
        Self {
            base_url:
                "https://ftp.uniprot.org/pub/databases/uniprot/current_release/knowledgebase/complete/"
                    .to_string(),
            release_notes_file: "reldate.txt".to_string(),
            checksums_file: "MD5SUMS".to_string(),
            relnotes_url: "https://ftp.uniprot.org/pub/databases/uniprot/relnotes.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliSettings {
    #[serde(flatten)]
    pub pipeline: Settings,
    pub sources: SourceUrls,
}

/// Load settings from an optional YAML file plus the environment.
pub fn load(config_file: Option<&Path>) -> Result<CliSettings> {
    let mut settings = match config_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_yaml::from_str::<CliSettings>(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => CliSettings::default(),
    };
    settings.pipeline.apply_env()?;
    if let Ok(v) = std::env::var("UPL_SOURCE_BASE_URL") {
        settings.sources.base_url = v;
    }
    settings.pipeline.validate()?;
    Ok(settings)
}

/// Render settings for `check-config`, masking the database password.
pub fn display(settings: &CliSettings) -> String {
    let mut masked = settings.clone();
    masked.pipeline.database_url = mask_password(&masked.pipeline.database_url);
    serde_yaml::to_string(&masked).unwrap_or_else(|_| "<unprintable settings>".to_string())
}

fn mask_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_public_mirror() {
        let settings = CliSettings::default();
        assert!(settings.sources.base_url.contains("ftp.uniprot.org"));
        assert_eq!(settings.pipeline.production_schema, "uniprot_public");
    }

    #[test]
    fn yaml_file_overrides_pipeline_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "production_schema: uniprot_test\nprofile: full\nsources:\n  base_url: http://mirror.local/\n",
        )
        .unwrap();
        let settings = load(Some(&path)).unwrap();
        assert_eq!(settings.pipeline.production_schema, "uniprot_test");
        assert_eq!(settings.pipeline.profile, upl_core::Profile::Full);
        assert_eq!(settings.sources.base_url, "http://mirror.local/");
    }

    #[test]
    fn password_is_masked() {
        assert_eq!(
            mask_password("postgres://alice:secret@db:5432/uniprot"),
            "postgres://alice:***@db:5432/uniprot"
        );
        assert_eq!(mask_password("postgres://db/uniprot"), "postgres://db/uniprot");
    }
}
