//! Warm-up of static reference data.
//!
//! Reads a directory of JSON documents named
//! `{contentType}.{scope}.{language}.json` and writes each one into the cache
//! under `{contentType}:{scope}:{language}` as [`ContentClass::StaticReference`].
//! Run it against the shared Redis before traffic arrives so the first
//! requests of every instance hit the distributed tier instead of the origin.

use std::path::Path;

use anyhow::Context;
use serde_json::Value;

use crate::cache::{CacheKey, ContentCache, ContentClass};

/// Outcome of a warm-up run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// Keys written to the cache
    pub loaded: Vec<String>,
    /// Files ignored (bad name, filtered language, unparsable JSON)
    pub skipped: usize,
}

/// Load every reference document under `dir`.
///
/// `languages` filters by the language part of the file name; empty loads all.
/// A single bad file is logged and skipped; an unreadable directory fails the run.
pub async fn warm_static_reference(
    cache: &ContentCache,
    dir: impl AsRef<Path>,
    languages: &[String],
) -> anyhow::Result<WarmupReport> {
    let dir = dir.as_ref();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading warm-up directory {}", dir.display()))?;

    let mut report = WarmupReport::default();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let Some(key) = key_for_file(&path) else {
            tracing::warn!(path = %path.display(), "file name is not contentType.scope.language.json");
            report.skipped += 1;
            continue;
        };
        if !languages.is_empty() && !languages.iter().any(|l| l == key.language()) {
            report.skipped += 1;
            continue;
        }

        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let value: Value = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping invalid JSON document");
                report.skipped += 1;
                continue;
            }
        };

        cache
            .set(key.as_str(), value, ContentClass::StaticReference)
            .await;
        tracing::debug!(key = %key, "warmed");
        report.loaded.push(key.into());
    }

    report.loaded.sort();
    tracing::info!(
        loaded = report.loaded.len(),
        skipped = report.skipped,
        dir = %dir.display(),
        "static reference warm-up finished"
    );
    Ok(report)
}

fn key_for_file(path: &Path) -> Option<CacheKey> {
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.rsplitn(3, '.');
    let language = parts.next()?;
    let scope = parts.next()?;
    let content_type = parts.next()?;
    if [content_type, scope, language].iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(CacheKey::new(content_type, scope, language))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_key_for_file() {
        let key = key_for_file(&PathBuf::from("/data/ksa.all.en.json")).unwrap();
        assert_eq!(key.as_str(), "ksa:all:en");

        let key = key_for_file(&PathBuf::from("domain.map.v2.zh-TW.json")).unwrap();
        assert_eq!(key.as_str(), "domain.map:v2:zh-TW");

        assert!(key_for_file(&PathBuf::from("ksa.en.json")).is_none());
        assert!(key_for_file(&PathBuf::from("ksa..en.json")).is_none());
    }

    #[tokio::test]
    async fn test_warm_static_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ksa.all.en.json"), r#"{"ids":[1,2,3]}"#).unwrap();
        std::fs::write(dir.path().join("ksa.all.zh.json"), r#"{"ids":[1]}"#).unwrap();
        std::fs::write(dir.path().join("broken.all.en.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let cache = ContentCache::builder().build();
        let report = warm_static_reference(&cache, dir.path(), &["en".to_string()])
            .await
            .unwrap();

        assert_eq!(report.loaded, vec!["ksa:all:en".to_string()]);
        assert_eq!(report.skipped, 2);

        let hit = cache
            .get("ksa:all:en", ContentClass::StaticReference, || async {
                Ok::<Value, anyhow::Error>(Value::Null)
            })
            .await
            .unwrap();
        assert!(hit.is_hit());
        assert_eq!(hit.value["ids"][2], 3);
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let cache = ContentCache::builder().build();
        let result = warm_static_reference(&cache, "/definitely/not/here", &[]).await;
        assert!(result.is_err());
    }
}
