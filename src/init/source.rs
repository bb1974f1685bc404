//! The kinds of init source and how each resolves into [`InitData`].

use std::fmt;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use super::{InitData, ShareData};
use crate::catalog::Catalog;
use crate::config::CatalogConfig;
use crate::error::{CatalogError, CatalogResult};

/// One queued init source.
pub enum InitSource {
    /// A JSON document to fetch.
    Url(String),
    /// Inline data.
    Data { name: String, data: Box<InitData> },
    /// Data produced by a future, e.g. a converted legacy catalog.
    Deferred {
        name: String,
        future: BoxFuture<'static, CatalogResult<InitData>>,
    },
    /// Alternatives tried in order; the first that resolves is used.
    Options(Vec<InitSource>),
    /// A share service document holding versioned init sources.
    Share(String),
}

impl fmt::Debug for InitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            InitSource::Data { name, .. } => f.debug_struct("Data").field("name", name).finish(),
            InitSource::Deferred { name, .. } => f.debug_struct("Deferred").field("name", name).finish(),
            InitSource::Options(options) => f.debug_tuple("Options").field(options).finish(),
            InitSource::Share(url) => f.debug_tuple("Share").field(url).finish(),
        }
    }
}

impl InitSource {
    pub fn data(name: impl Into<String>, data: InitData) -> Self {
        InitSource::Data {
            name: name.into(),
            data: Box::new(data),
        }
    }

    pub fn deferred(
        name: impl Into<String>,
        future: impl std::future::Future<Output = CatalogResult<InitData>> + Send + 'static,
    ) -> Self {
        InitSource::Deferred {
            name: name.into(),
            future: future.boxed(),
        }
    }

    /// A configured name: a `.json` URL as is, otherwise one candidate file
    /// per init fragment path.
    pub fn from_name(name: &str, config: &CatalogConfig) -> Self {
        if name.ends_with(".json") {
            return InitSource::Url(name.to_string());
        }
        InitSource::Options(
            config
                .init_fragment_paths
                .iter()
                .map(|path| InitSource::Url(format!("{}{}.json", path, name)))
                .collect(),
        )
    }

    /// An entry of a share payload's `initSources`: a name/URL or inline data.
    pub fn from_share_entry(index: usize, entry: Value, config: &CatalogConfig) -> CatalogResult<Self> {
        match entry {
            Value::String(name) => Ok(Self::from_name(&name, config)),
            other => {
                let name = format!("share data #{}", index);
                let data = InitData::from_value(&name, other)?;
                Ok(Self::data(name, data))
            }
        }
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> String {
        match self {
            InitSource::Url(url) | InitSource::Share(url) => url.clone(),
            InitSource::Data { name, .. } | InitSource::Deferred { name, .. } => name.clone(),
            InitSource::Options(options) => options
                .iter()
                .map(InitSource::name)
                .collect::<Vec<_>>()
                .join(" | "),
        }
    }

    /// Produce the data this source stands for. A share document yields one
    /// entry per nested source.
    pub(crate) fn resolve(self, catalog: &Catalog) -> BoxFuture<'_, CatalogResult<Vec<InitData>>> {
        async move {
            match self {
                InitSource::Url(url) => {
                    let document = catalog.fetcher().fetch_json(&url).await?;
                    Ok(vec![InitData::from_value(&url, document)?])
                }
                InitSource::Data { data, .. } => Ok(vec![*data]),
                InitSource::Deferred { future, .. } => Ok(vec![future.await?]),
                InitSource::Options(options) => {
                    let mut errors = Vec::new();
                    for option in options {
                        let name = option.name();
                        match option.resolve(catalog).await {
                            Ok(data) => return Ok(data),
                            Err(e) => {
                                log::debug!("Init source option {} failed: {}", name, e);
                                errors.push(e);
                            }
                        }
                    }
                    Err(CatalogError::combine(errors).unwrap_or_else(|| CatalogError::InvalidInitData {
                        source_name: "options".to_string(),
                        message: "no alternatives".to_string(),
                    }))
                }
                InitSource::Share(url) => {
                    let document = catalog.fetcher().fetch_json(&url).await?;
                    let share = ShareData::from_value(&url, document)?;
                    let mut resolved = Vec::with_capacity(share.init_sources.len());
                    for (index, entry) in share.init_sources.into_iter().enumerate() {
                        let source = InitSource::from_share_entry(index, entry, catalog.config())?;
                        resolved.extend(source.resolve(catalog).await?);
                    }
                    Ok(resolved)
                }
            }
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<Catalog>, Arc<MemoryFetcher>) {
        let fetcher = Arc::new(MemoryFetcher::new());
        let config = CatalogConfig {
            init_fragment_paths: vec!["init/".into(), "http://fallback/init/".into()],
            ..CatalogConfig::default()
        };
        (Catalog::with_fetcher(config, fetcher.clone()), fetcher)
    }

    #[test]
    fn test_from_name() {
        let config = CatalogConfig::default();
        assert!(matches!(InitSource::from_name("http://x/a.json", &config), InitSource::Url(ref u) if u == "http://x/a.json"));
        match InitSource::from_name("terria", &config) {
            InitSource::Options(options) => assert_eq!(options[0].name(), "init/terria.json"),
            other => panic!("expected options, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_options_fall_back_in_order() {
        let (catalog, fetcher) = setup();
        fetcher.insert("http://fallback/init/terria.json", json!({"workbench": ["x"]}));
        let source = InitSource::from_name("terria", catalog.config());
        let data = source.resolve(&catalog).await.unwrap();
        assert_eq!(data[0].workbench, Some(vec!["x".to_string()]));
        assert_eq!(fetcher.calls("init/terria.json"), 1);
    }

    #[tokio::test]
    async fn test_share_document_expands_nested_sources() {
        let (catalog, fetcher) = setup();
        fetcher.insert("init/base.json", json!({"catalog": []}));
        fetcher.insert(
            "http://share/abc",
            json!({"version": "8.0.0", "initSources": ["base", {"workbench": ["a"]}]}),
        );
        let data = InitSource::Share("http://share/abc".into()).resolve(&catalog).await.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[1].workbench, Some(vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn test_deferred_source() {
        let (catalog, _fetcher) = setup();
        let source = InitSource::deferred("converted", async {
            Ok(InitData {
                viewer_mode: Some("2d".into()),
                ..InitData::default()
            })
        });
        assert_eq!(source.name(), "converted");
        let data = source.resolve(&catalog).await.unwrap();
        assert_eq!(data[0].viewer_mode.as_deref(), Some("2d"));
    }
}
