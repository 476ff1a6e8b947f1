use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info};

use timesift_core::labels::TAG_FIELD;

use crate::analyzer::{Analyzer, AnalyzerContext, AnalyzerDescriptor, EventQuery};
use crate::error::EngineError;

pub const NAME: &str = "domain";

const URL_HOST_PATTERN: &str = r"^[a-zA-Z][a-zA-Z0-9+.\-]*://(?:[^@/]*@)?([^:/?#\[\]]+)";
const CDN_TAG: &str = "known-cdn";
const VIEW_NAME: &str = "Domains";
const VIEW_QUERY: &str = "_exists_:domain";

/// Public suffixes spanning two labels.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "com.au", "net.au", "co.jp", "co.nz", "com.br", "co.za",
];

/// Domain suffix to CDN provider.
const CDN_DOMAINS: &[(&str, &str)] = &[
    ("akamaiedge.net", "Akamai"),
    ("akamai.net", "Akamai"),
    ("cloudfront.net", "Amazon CloudFront"),
    ("fastly.net", "Fastly"),
    ("cloudflare.net", "Cloudflare"),
    ("azureedge.net", "Azure CDN"),
    ("edgecastcdn.net", "Edgecast"),
];

pub fn descriptor() -> AnalyzerDescriptor {
    AnalyzerDescriptor::new(NAME, "Domain extraction").sketch_analyzer()
}

/// Extracts the host of every event's `url`, records it with its
/// registrable domain, and tags hosts served by a known CDN.
pub struct DomainAnalyzer {
    url_host: Regex,
}

impl DomainAnalyzer {
    pub fn new() -> Result<Self, EngineError> {
        let url_host = Regex::new(URL_HOST_PATTERN)
            .map_err(|e| EngineError::Validation(format!("invalid url pattern: {e}")))?;
        Ok(Self { url_host })
    }

    /// Lowercased host of `url`, if it has a scheme and a host.
    pub fn host(&self, url: &str) -> Option<String> {
        let host = self.url_host.captures(url.trim())?.get(1)?.as_str();
        let host = host.trim_end_matches('.').to_lowercase();
        (!host.is_empty()).then_some(host)
    }
}

/// Registrable domain of `host`: the public suffix plus one label.
/// IP addresses and single-label hosts have none.
pub fn registrable_domain(host: &str) -> Option<String> {
    if host.parse::<IpAddr>().is_ok() {
        return None;
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return None;
    }
    let suffix = labels[labels.len() - 2..].join(".");
    let keep = if labels.len() >= 3 && MULTI_LABEL_SUFFIXES.contains(&suffix.as_str()) {
        3
    } else {
        2
    };
    Some(labels[labels.len() - keep..].join("."))
}

pub fn cdn_provider(host: &str) -> Option<&'static str> {
    CDN_DOMAINS
        .iter()
        .find(|(suffix, _)| {
            host == *suffix
                || host
                    .strip_suffix(suffix)
                    .is_some_and(|rest| rest.ends_with('.'))
        })
        .map(|(_, provider)| *provider)
}

#[async_trait]
impl Analyzer for DomainAnalyzer {
    async fn run(&self, ctx: &AnalyzerContext) -> Result<String, EngineError> {
        let query = EventQuery::new("_exists_:url").return_fields(["url", TAG_FIELD]);
        let mut events = ctx.event_stream(query).await?;

        let mut domains: BTreeMap<String, usize> = BTreeMap::new();
        let mut on_cdn = 0usize;
        while let Some(event) = events.next().await {
            let mut event = event?;
            let Some(host) = event.get_str("url").and_then(|url| self.host(url)) else {
                debug!(event_id = event.event_id(), "no host in url");
                continue;
            };

            let mut attributes = Map::new();
            attributes.insert("domain".into(), Value::from(host.clone()));
            if let Some(tld) = registrable_domain(&host) {
                attributes.insert("tld".into(), Value::from(tld));
            }
            let provider = cdn_provider(&host);
            if let Some(provider) = provider {
                attributes.insert("cdn_provider".into(), Value::from(provider));
            }
            event.add_attributes(attributes).await?;
            if provider.is_some() {
                event.add_tags(&[CDN_TAG]).await?;
                on_cdn += 1;
            }
            *domains.entry(host).or_default() += 1;
        }

        if domains.is_empty() {
            return Ok("No domains found".into());
        }
        if let Some(sketch) = ctx.sketch() {
            sketch.add_view(VIEW_NAME, Some(VIEW_QUERY), None, None)?;
        }
        info!(domains = domains.len(), on_cdn, "domains extracted");
        Ok(format!(
            "{} domains discovered, {} events on known CDNs",
            domains.len(),
            on_cdn
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, INDEX};
    use serde_json::json;
    use timesift_store::views::ViewRepo;

    #[test]
    fn host_extraction() {
        let analyzer = DomainAnalyzer::new().unwrap();
        assert_eq!(
            analyzer.host("https://user:pw@WWW.Example.com:8443/path?q=1").as_deref(),
            Some("www.example.com")
        );
        assert_eq!(analyzer.host("ftp://files.example.org.").as_deref(), Some("files.example.org"));
        assert_eq!(analyzer.host("http://10.0.0.1/admin").as_deref(), Some("10.0.0.1"));
        assert!(analyzer.host("example.com/no-scheme").is_none());
        assert!(analyzer.host("not a url").is_none());
    }

    #[test]
    fn registrable_domains() {
        assert_eq!(registrable_domain("a.b.example.com").as_deref(), Some("example.com"));
        assert_eq!(registrable_domain("www.bbc.co.uk").as_deref(), Some("bbc.co.uk"));
        assert_eq!(registrable_domain("co.uk").as_deref(), Some("co.uk"));
        assert!(registrable_domain("10.0.0.1").is_none());
        assert!(registrable_domain("localhost").is_none());
    }

    #[test]
    fn cdn_suffix_needs_label_boundary() {
        assert_eq!(cdn_provider("e123.a.akamaiedge.net"), Some("Akamai"));
        assert_eq!(cdn_provider("d1.cloudfront.net"), Some("Amazon CloudFront"));
        assert_eq!(cdn_provider("cloudfront.net"), Some("Amazon CloudFront"));
        assert!(cdn_provider("notcloudfront.net").is_none());
        assert!(cdn_provider("example.com").is_none());
    }

    #[tokio::test]
    async fn annotates_events_and_saves_view() {
        let fx = Fixture::new();
        fx.insert("1", json!({"url": "https://www.example.com/a", "message": "visit"}));
        fx.insert("2", json!({"url": "http://example.com/b"}));
        fx.insert("3", json!({"url": "https://d1.cloudfront.net/x.js", "tag": ["web"]}));
        fx.insert("4", json!({"message": "no url here"}));

        let result = fx.run(&descriptor(), DomainAnalyzer::new().unwrap()).await.unwrap();
        assert_eq!(result, "3 domains discovered, 1 events on known CDNs");

        let first = fx.datastore.document(INDEX, "1").unwrap();
        assert_eq!(first["domain"], "www.example.com");
        assert_eq!(first["tld"], "example.com");
        assert!(first.get("cdn_provider").is_none());
        assert!(first.get("tag").is_none());

        let cdn = fx.datastore.document(INDEX, "3").unwrap();
        assert_eq!(cdn["cdn_provider"], "Amazon CloudFront");
        assert_eq!(cdn["tag"], json!(["known-cdn", "web"]));

        assert!(fx.datastore.document(INDEX, "4").unwrap().get("domain").is_none());

        let views = ViewRepo::new(fx.db.clone()).list(fx.sketch_id).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].name, "Domains");
        assert_eq!(views[0].query_string.as_deref(), Some("_exists_:domain"));
    }

    #[tokio::test]
    async fn nothing_found_saves_no_view() {
        let fx = Fixture::new();
        fx.insert("1", json!({"url": "not a url"}));

        let result = fx.run(&descriptor(), DomainAnalyzer::new().unwrap()).await.unwrap();
        assert_eq!(result, "No domains found");
        assert!(ViewRepo::new(fx.db.clone()).list(fx.sketch_id).unwrap().is_empty());
        assert_eq!(fx.datastore.flush_count(), 1);
    }
}
