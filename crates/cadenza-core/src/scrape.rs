//! Web-scraping collaborator.
//!
//! The engine hands a URL (plus optional domain allow-list and headers) to a
//! [`Scraper`] and gets back a structured page. The default implementation
//! fetches with a blocking HTTP client and extracts title, paragraphs, and
//! links with regular expressions.

use anyhow::{anyhow, bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("static regex"));
static PARA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<p[^>]*>(.*?)</p>").expect("static regex"));
static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<a[^>]+href\s*=\s*["']([^"']+)["']"#).expect("static regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("static regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub url: String,
    pub title: String,
    pub paragraphs: Vec<String>,
    pub links: Vec<String>,
    pub status: u16,
    pub content_type: String,
}

pub trait Scraper: Send + Sync {
    fn scrape(&self, url: &str) -> Result<ScrapedPage>;
    fn set_allowed_domains(&mut self, domains: Vec<String>);
    fn set_custom_headers(&mut self, headers: HashMap<String, String>);
}

pub struct HttpScraper {
    allowed_domains: Vec<String>,
    headers: HashMap<String, String>,
    client: reqwest::blocking::Client,
}

impl HttpScraper {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        HttpScraper {
            allowed_domains: Vec::new(),
            headers: HashMap::new(),
            client,
        }
    }

    /// Exact host match, or any subdomain of an allowed domain. An empty
    /// allow-list permits every host.
    fn domain_allowed(&self, host: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        self.allowed_domains
            .iter()
            .any(|d| host == d || host.ends_with(&format!(".{}", d)))
    }
}

impl Default for HttpScraper {
    fn default() -> Self {
        Self::new()
    }
}

impl Scraper for HttpScraper {
    fn scrape(&self, url: &str) -> Result<ScrapedPage> {
        let host = host_of(url).ok_or_else(|| anyhow!("cannot parse host from '{}'", url))?;
        if !self.domain_allowed(&host) {
            bail!("domain '{}' is not in the allowed list", host);
        }

        let mut request = self.client.get(url);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request.send()?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text()?;

        Ok(parse_page(url, status, &content_type, &body))
    }

    fn set_allowed_domains(&mut self, domains: Vec<String>) {
        self.allowed_domains = domains;
    }

    fn set_custom_headers(&mut self, headers: HashMap<String, String>) {
        self.headers = headers;
    }
}

/// Pulls the host out of an http(s) URL without a URL-parsing dependency.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn parse_page(url: &str, status: u16, content_type: &str, body: &str) -> ScrapedPage {
    let title = TITLE_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| collapse_whitespace(&TAG_RE.replace_all(m.as_str(), "")))
        .unwrap_or_default();

    let paragraphs = PARA_RE
        .captures_iter(body)
        .filter_map(|c| c.get(1))
        .map(|m| collapse_whitespace(&TAG_RE.replace_all(m.as_str(), "")))
        .filter(|p| !p.is_empty())
        .collect();

    let links = LINK_RE
        .captures_iter(body)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect();

    ScrapedPage {
        url: url.to_string(),
        title,
        paragraphs,
        links,
        status,
        content_type: content_type.to_string(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_filter_matches_exact_and_subdomains() {
        let mut scraper = HttpScraper::new();
        scraper.set_allowed_domains(vec!["example.com".to_string()]);
        assert!(scraper.domain_allowed("example.com"));
        assert!(scraper.domain_allowed("docs.example.com"));
        assert!(!scraper.domain_allowed("example.org"));
        assert!(!scraper.domain_allowed("badexample.com"));
    }

    #[test]
    fn empty_allow_list_permits_all() {
        let scraper = HttpScraper::new();
        assert!(scraper.domain_allowed("anything.invalid"));
    }

    #[test]
    fn extracts_host() {
        assert_eq!(host_of("https://example.com/a/b").unwrap(), "example.com");
        assert_eq!(host_of("http://example.com:8080").unwrap(), "example.com");
        assert_eq!(host_of("https://user@example.com/x").unwrap(), "example.com");
        assert!(host_of("ftp://example.com").is_none());
    }

    #[test]
    fn parses_title_paragraphs_and_links() {
        let html = r#"<html><head><title> A  Page </title></head>
<body><p>First <b>para</b>.</p><p></p><p>Second.</p>
<a href="https://example.com/one">one</a></body></html>"#;
        let page = parse_page("https://example.com", 200, "text/html", html);
        assert_eq!(page.title, "A Page");
        assert_eq!(page.paragraphs, vec!["First para.", "Second."]);
        assert_eq!(page.links, vec!["https://example.com/one"]);
        assert_eq!(page.status, 200);
    }
}
