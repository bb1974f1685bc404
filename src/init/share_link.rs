//! Share links: application URLs whose hash fragment queues init sources.
//!
//! ```text
//! http://host/#clean&parks&start={"version":"8.0.0","initSources":[...]}&share=abc&mode=2d
//! ```
//!
//! - `start=<json>` inline, versioned share data
//! - `share=<id>` share data stored by the share service
//! - `clean` drops every source queued so far
//! - a bare name is an init fragment file
//! - any other `key=value` pair becomes a user property

use super::{InitSource, ShareData};
use crate::catalog::Catalog;
use crate::error::{CatalogError, CatalogResult};

/// One `&`-separated part of a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentPart {
    /// A part without `=`.
    Name(String),
    /// A `key=value` part with the value percent-decoded.
    Pair(String, String),
}

/// Split the fragment of `url` (or a bare fragment) into its parts.
pub fn parse_fragment(url: &str) -> CatalogResult<Vec<FragmentPart>> {
    let fragment = match url.split_once('#') {
        Some((_, fragment)) => fragment,
        None if url.contains("://") => "",
        None => url,
    };
    fragment
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => {
                let value = urlencoding::decode(value).map_err(|e| CatalogError::InvalidInitData {
                    source_name: key.to_string(),
                    message: e.to_string(),
                })?;
                Ok(FragmentPart::Pair(key.to_string(), value.into_owned()))
            }
            None => Ok(FragmentPart::Name(part.to_string())),
        })
        .collect()
}

impl Catalog {
    /// Queue the init sources a share link describes.
    ///
    /// `clean` applies first, wherever it appears. Nothing is queued when
    /// any part is invalid.
    pub fn queue_share_link(&self, url: &str) -> CatalogResult<()> {
        let parts = parse_fragment(url)?;
        let clean = parts
            .iter()
            .any(|part| matches!(part, FragmentPart::Name(name) if name == "clean"));

        let mut sources = Vec::new();
        let mut properties = Vec::new();
        for part in parts {
            match part {
                FragmentPart::Name(name) if name == "clean" => {}
                FragmentPart::Name(name) => sources.push(InitSource::from_name(&name, self.config())),
                FragmentPart::Pair(key, value) if key == "start" => {
                    let document = serde_json::from_str(&value).map_err(|e| CatalogError::InvalidInitData {
                        source_name: "start".to_string(),
                        message: e.to_string(),
                    })?;
                    let share = ShareData::from_value("start", document)?;
                    for (index, entry) in share.init_sources.into_iter().enumerate() {
                        sources.push(InitSource::from_share_entry(index, entry, self.config())?);
                    }
                }
                FragmentPart::Pair(key, value) if key == "share" => {
                    let service = self.config().share_service_url.as_deref().ok_or_else(|| {
                        CatalogError::InvalidInitData {
                            source_name: "share".to_string(),
                            message: "no share service is configured".to_string(),
                        }
                    })?;
                    sources.push(InitSource::Share(format!(
                        "{}/{}",
                        service.trim_end_matches('/'),
                        urlencoding::encode(&value)
                    )));
                }
                FragmentPart::Pair(key, value) => properties.push((key, value)),
            }
        }

        if clean {
            let dropped = std::mem::take(&mut *self.init_queue().lock());
            log::debug!("Share link dropped {} queued init sources", dropped.len());
        }
        for source in sources {
            self.queue_init_source(source);
        }
        if !properties.is_empty() {
            self.update_view(|view| view.user_properties.extend(properties));
        }
        Ok(())
    }

    /// Queue a share link and apply every queued source.
    pub async fn apply_share_link(&self, url: &str) -> CatalogResult<()> {
        self.queue_share_link(url)?;
        self.load_init_sources().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::fetch::MemoryFetcher;
    use crate::init::InitData;
    use serde_json::json;
    use std::sync::Arc;

    fn setup(share_service: Option<&str>) -> (Arc<Catalog>, Arc<MemoryFetcher>) {
        let fetcher = Arc::new(MemoryFetcher::new());
        let config = CatalogConfig {
            share_service_url: share_service.map(str::to_string),
            ..CatalogConfig::default()
        };
        (Catalog::with_fetcher(config, fetcher.clone()), fetcher)
    }

    #[test]
    fn test_parse_fragment() {
        let parts = parse_fragment("http://host/app/#parks&mode=3d&start=%7B%22a%22%3A1%7D").unwrap();
        assert_eq!(
            parts,
            vec![
                FragmentPart::Name("parks".into()),
                FragmentPart::Pair("mode".into(), "3d".into()),
                FragmentPart::Pair("start".into(), r#"{"a":1}"#.into()),
            ]
        );
        assert!(parse_fragment("http://host/app/").unwrap().is_empty());
        assert_eq!(parse_fragment("clean").unwrap(), vec![FragmentPart::Name("clean".into())]);
    }

    #[test]
    fn test_clean_drops_earlier_sources() {
        let (catalog, _) = setup(None);
        catalog.queue_init_source(InitSource::data("config", InitData::default()));
        catalog.queue_share_link("http://host/#parks&clean").unwrap();
        assert_eq!(catalog.queued_init_sources(), 1);
    }

    #[test]
    fn test_legacy_start_data_rejected() {
        let (catalog, _) = setup(None);
        let start = urlencoding::encode(r#"{"version":"0.0.05","initSources":[]}"#).into_owned();
        let err = catalog
            .queue_share_link(&format!("http://host/#parks&start={}", start))
            .unwrap_err();
        assert_eq!(err, CatalogError::UnsupportedShareVersion("0.0.05".into()));
        assert_eq!(catalog.queued_init_sources(), 0);
    }

    #[test]
    fn test_share_requires_service() {
        let (catalog, _) = setup(None);
        assert!(catalog.queue_share_link("#share=abc").is_err());
    }

    #[tokio::test]
    async fn test_start_data_applies_and_properties_are_kept() {
        let (catalog, _) = setup(None);
        let start = urlencoding::encode(
            r#"{"version":"8.0.0","initSources":[{"catalog":[{"id":"g","type":"group"}],"viewerMode":"2d"}]}"#,
        )
        .into_owned();
        catalog
            .apply_share_link(&format!("http://host/#start={}&hideWelcome=1", start))
            .await
            .unwrap();
        assert!(catalog.models().contains("g"));
        let view = catalog.view();
        assert_eq!(view.viewer_mode.as_deref(), Some("2d"));
        assert_eq!(view.user_properties.get("hideWelcome").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_share_service_link() {
        let (catalog, fetcher) = setup(Some("http://share/api/"));
        fetcher.insert(
            "http://share/api/abc",
            json!({"version": "8.0.0", "initSources": [{"workbench": [], "splitPosition": 0.7}]}),
        );
        catalog.apply_share_link("http://host/#share=abc").await.unwrap();
        assert_eq!(catalog.view().split_position, Some(0.7));
    }
}
