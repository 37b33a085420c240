//! Web-facing tools: search, page fetch and onion reachability
//!
//! [`WebTools`] is the seam the executor talks to; [`HttpWebTools`] is the
//! reqwest implementation. Proxy-routed calls go through a SOCKS5h proxy so
//! DNS resolution happens inside the proxy network.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ToolConfig;
use crate::error::ToolError;

/// DuckDuckGo's JavaScript-free results page
const DUCK_HTML_URL: &str = "https://html.duckduckgo.com/html/";

/// Maximum outlinks returned per page
const MAX_LINKS: usize = 100;

/// Bytes read from a fetched page before the rest is discarded
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// How a request leaves the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    /// Through the local SOCKS port of the proxy daemon
    Socks(u16),
}

impl Route {
    fn proxy_url(&self) -> Option<String> {
        match self {
            Route::Direct => None,
            Route::Socks(port) => Some(format!("socks5h://127.0.0.1:{}", port)),
        }
    }
}

/// Backend for the network tools
#[async_trait]
pub trait WebTools: Send + Sync {
    /// Keyword search; returns `{"results": [{title, url, content}]}`
    async fn duck_search(&self, query: &str, max_results: usize) -> Result<Value, ToolError>;

    /// Fetch a page; returns `{title, url, content, links}`
    async fn fetch_page(&self, url: &str, max_chars: usize, route: Route) -> Result<Value, ToolError>;

    /// Search through the proxy using an Ahmia-compatible engine
    async fn tor_search(&self, query: &str, base_url: &str, route: Route) -> Result<Value, ToolError>;

    /// Report whether an onion service answers at all
    async fn onion_up(&self, url: &str, timeout: Duration, route: Route) -> Result<Value, ToolError>;
}

/// reqwest + scraper implementation of [`WebTools`]
pub struct HttpWebTools {
    direct: reqwest::Client,
    socks: Mutex<Option<(u16, reqwest::Client)>>,
    user_agent: String,
    timeout: Duration,
}

impl HttpWebTools {
    pub fn new(config: &ToolConfig) -> Result<Self, ToolError> {
        let direct = build_client(&config.user_agent, config.http_timeout, None, true)?;
        Ok(Self {
            direct,
            socks: Mutex::new(None),
            user_agent: config.user_agent.clone(),
            timeout: config.http_timeout,
        })
    }

    fn client(&self, route: Route) -> Result<reqwest::Client, ToolError> {
        let Route::Socks(port) = route else {
            return Ok(self.direct.clone());
        };

        let mut cached = self
            .socks
            .lock()
            .map_err(|_| ToolError::failed("socks client cache poisoned"))?;
        if let Some((cached_port, client)) = cached.as_ref() {
            if *cached_port == port {
                return Ok(client.clone());
            }
        }
        let client = build_client(&self.user_agent, self.timeout, route.proxy_url(), true)?;
        *cached = Some((port, client.clone()));
        Ok(client)
    }

    async fn get_text(&self, url: &str, route: Route) -> Result<Page, ToolError> {
        let response = self
            .client(route)?
            .get(url)
            .header(ACCEPT, "*/*")
            .send()
            .await
            .map_err(|e| ToolError::failed(format!("request to {} failed: {}", url, e)))?;

        let final_url = response.url().to_string();
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if !status.is_success() {
            return Err(ToolError::failed(format!("{} returned HTTP {}", final_url, status)));
        }
        if content_type.contains("application/pdf") || final_url.to_ascii_lowercase().ends_with(".pdf") {
            return Err(ToolError::failed(format!(
                "{} is a PDF document; PDF extraction is not supported",
                final_url
            )));
        }

        let body = read_capped(response, MAX_BODY_BYTES)
            .await
            .map_err(|e| ToolError::failed(format!("reading body of {} failed: {}", final_url, e)))?;

        Ok(Page {
            url: final_url,
            is_html: content_type.is_empty() || content_type.contains("html"),
            body,
        })
    }
}

struct Page {
    url: String,
    is_html: bool,
    body: String,
}

/// Read at most `limit` bytes of the body; the rest is dropped unread
async fn read_capped(response: reqwest::Response, limit: usize) -> Result<String, reqwest::Error> {
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let room = limit - buf.len();
        if chunk.len() >= room {
            buf.extend_from_slice(&chunk[..room]);
            debug!(limit, "response body cut at byte limit");
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn build_client(
    user_agent: &str,
    timeout: Duration,
    proxy: Option<String>,
    follow_redirects: bool,
) -> Result<reqwest::Client, ToolError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(timeout);

    if !follow_redirects {
        builder = builder.redirect(reqwest::redirect::Policy::none());
    }
    if let Some(proxy_url) = proxy {
        let proxy = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| ToolError::failed(format!("invalid proxy {}: {}", proxy_url, e)))?;
        builder = builder.proxy(proxy);
    } else {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|e| ToolError::failed(format!("failed to build HTTP client: {}", e)))
}

#[async_trait]
impl WebTools for HttpWebTools {
    async fn duck_search(&self, query: &str, max_results: usize) -> Result<Value, ToolError> {
        let response = self
            .direct
            .post(DUCK_HTML_URL)
            .form(&[("q", query), ("kl", "us-en")])
            .send()
            .await
            .map_err(|e| ToolError::failed(format!("search request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ToolError::failed(format!(
                "search endpoint returned HTTP {}",
                response.status()
            )));
        }
        let html = response
            .text()
            .await
            .map_err(|e| ToolError::failed(format!("reading search results failed: {}", e)))?;

        let results = parse_duck_results(&html, max_results);
        debug!(query, results = results.len(), "duck_search");
        Ok(json!({ "results": results }))
    }

    async fn fetch_page(&self, url: &str, max_chars: usize, route: Route) -> Result<Value, ToolError> {
        let page = self.get_text(url, route).await?;

        if !page.is_html {
            return Ok(json!({
                "title": "",
                "url": page.url,
                "content": clip_chars(&tidy_text(&page.body), max_chars),
                "links": [],
            }));
        }

        let doc = Html::parse_document(&page.body);
        Ok(json!({
            "title": page_title(&doc).unwrap_or_else(|| "Untitled".to_string()),
            "url": page.url,
            "content": clip_chars(&visible_text(&doc), max_chars),
            "links": extract_links(&doc, &page.url),
        }))
    }

    async fn tor_search(&self, query: &str, base_url: &str, route: Route) -> Result<Value, ToolError> {
        let mut search_url = url::Url::parse(base_url)
            .map_err(|e| ToolError::invalid(format!("invalid base_url: {}", e)))?;
        search_url.query_pairs_mut().append_pair("q", query);

        let page = self.get_text(search_url.as_str(), route).await?;
        let doc = Html::parse_document(&page.body);

        let mut results = parse_ahmia_results(&doc);
        if results.is_empty() {
            results.push(json!({
                "title": page_title(&doc).unwrap_or_else(|| "Search Results".to_string()),
                "url": page.url,
                "content": clip_chars(&visible_text(&doc), 20_000),
            }));
        }

        Ok(json!({
            "results": results,
            "meta": { "query": query, "search_url": page.url, "engine_base": base_url },
        }))
    }

    async fn onion_up(&self, url: &str, timeout: Duration, route: Route) -> Result<Value, ToolError> {
        let client = build_client(&self.user_agent, timeout, route.proxy_url(), false)?;

        let request = |method: reqwest::Method, target: String| {
            let client = client.clone();
            async move {
                client
                    .request(method, &target)
                    .header(ACCEPT, "*/*")
                    .send()
                    .await
                    .map(|r| r.status().as_u16())
                    .map_err(|e| e.to_string())
            }
        };

        // Any HTTP answer, even 4xx/5xx, means the service is up
        let mut outcome = request(reqwest::Method::HEAD, url.to_string()).await;
        if outcome.is_err() {
            if let Some(host) = url.strip_prefix("https://") {
                let plain = format!("http://{}", host);
                outcome = request(reqwest::Method::HEAD, plain.clone()).await;
                if outcome.is_err() {
                    outcome = request(reqwest::Method::GET, plain).await;
                }
            } else {
                outcome = request(reqwest::Method::GET, url.to_string()).await;
            }
        }

        Ok(match outcome {
            Ok(code) => json!({ "up": true, "url": url, "http_status": code, "error": null }),
            Err(err) => json!({ "up": false, "url": url, "http_status": null, "error": err }),
        })
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse DuckDuckGo's html endpoint
fn parse_duck_results(html: &str, max_results: usize) -> Vec<Value> {
    let doc = Html::parse_document(html);
    let (Some(result_sel), Some(link_sel), Some(snippet_sel)) = (
        selector("div.result"),
        selector("a.result__a"),
        selector(".result__snippet"),
    ) else {
        return Vec::new();
    };

    doc.select(&result_sel)
        .filter_map(|result| {
            let link = result.select(&link_sel).next()?;
            let href = link.value().attr("href")?;
            let url = unwrap_duck_redirect(href);
            if url.contains("duckduckgo.com/y.js") {
                return None;
            }
            Some(json!({
                "title": element_text(link),
                "url": url,
                "content": result.select(&snippet_sel).next().map(element_text).unwrap_or_default(),
            }))
        })
        .take(max_results)
        .collect()
}

/// Result links point at `//duckduckgo.com/l/?uddg=<target>`
fn unwrap_duck_redirect(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href.to_string()
    };
    url::Url::parse(&absolute)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "uddg")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or(absolute)
}

/// Ahmia result list: `li.result` with a title link and a snippet
fn parse_ahmia_results(doc: &Html) -> Vec<Value> {
    let (Some(item_sel), Some(link_sel), Some(snippet_sel), Some(cite_sel)) = (
        selector("li.result"),
        selector("h4 a, a"),
        selector("p"),
        selector("cite"),
    ) else {
        return Vec::new();
    };

    doc.select(&item_sel)
        .filter_map(|item| {
            let link = item.select(&link_sel).next()?;
            let href = link.value().attr("href").unwrap_or_default();
            let url = item
                .select(&cite_sel)
                .next()
                .map(element_text)
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| unwrap_redirect_param(href));
            Some(json!({
                "title": element_text(link),
                "url": url,
                "content": item.select(&snippet_sel).next().map(element_text).unwrap_or_default(),
            }))
        })
        .collect()
}

/// Ahmia wraps targets as `/search/redirect?...&redirect_url=<target>`
fn unwrap_redirect_param(href: &str) -> String {
    url::Url::parse("https://ahmia.fi")
        .and_then(|base| base.join(href))
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "redirect_url")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or_else(|| href.to_string())
}

fn page_title(doc: &Html) -> Option<String> {
    let sel = selector("title")?;
    doc.select(&sel)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

/// Text of the document body, skipping script/style/noscript content
pub(crate) fn visible_text(doc: &Html) -> String {
    let root = selector("body")
        .and_then(|sel| doc.select(&sel).next())
        .unwrap_or_else(|| doc.root_element());

    let mut out = String::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|e| matches!(e.name(), "script" | "style" | "noscript" | "template"))
                .unwrap_or(false)
        });
        if !hidden {
            out.push_str(text);
            out.push('\n');
        }
    }
    tidy_text(&out)
}

/// Absolute, de-duplicated outlinks in document order
pub(crate) fn extract_links(doc: &Html, base_url: &str) -> Vec<String> {
    let Some(sel) = selector("a[href]") else {
        return Vec::new();
    };
    let base = url::Url::parse(base_url).ok();

    let mut links: Vec<String> = Vec::new();
    for a in doc.select(&sel) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let resolved = match &base {
            Some(b) => b.join(href).map(|u| u.to_string()).unwrap_or_else(|_| href.to_string()),
            None => href.to_string(),
        };
        if !links.contains(&resolved) {
            links.push(resolved);
        }
        if links.len() >= MAX_LINKS {
            break;
        }
    }
    links
}

/// Trim trailing spaces per line and collapse blank runs
pub(crate) fn tidy_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0;
    for line in s.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(line.trim_start_matches([' ', '\t']));
            out.push('\n');
        }
    }
    out.trim().to_string()
}

pub(crate) fn clip_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUCK_PAGE: &str = r#"
        <html><body>
          <div class="result results_links">
            <h2><a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust-lang.org%2F&rut=abc">Rust  Programming Language</a></h2>
            <a class="result__snippet">A language empowering everyone.</a>
          </div>
          <div class="result">
            <a class="result__a" href="https://duckduckgo.com/y.js?ad=1">Ad</a>
          </div>
          <div class="result">
            <a class="result__a" href="https://doc.rust-lang.org/book/">The Book</a>
            <div class="result__snippet">Learn Rust.</div>
          </div>
        </body></html>"#;

    #[test]
    fn test_parse_duck_results() {
        let results = parse_duck_results(DUCK_PAGE, 5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["url"], "https://www.rust-lang.org/");
        assert_eq!(results[0]["title"], "Rust Programming Language");
        assert_eq!(results[0]["content"], "A language empowering everyone.");
        assert_eq!(results[1]["url"], "https://doc.rust-lang.org/book/");
    }

    #[test]
    fn test_parse_duck_results_respects_limit() {
        assert_eq!(parse_duck_results(DUCK_PAGE, 1).len(), 1);
    }

    #[test]
    fn test_visible_text_skips_scripts() {
        let doc = Html::parse_document(
            "<html><head><title>T</title><style>p{}</style></head><body><p>Hello</p><script>var x=1;</script><p>World</p></body></html>",
        );
        let text = visible_text(&doc);
        assert!(text.contains("Hello"));
        assert!(text.contains("World"));
        assert!(!text.contains("var x"));
        assert_eq!(page_title(&doc).as_deref(), Some("T"));
    }

    #[test]
    fn test_extract_links_resolves_and_dedups() {
        let doc = Html::parse_document(
            r#"<body><a href="/a">A</a><a href="https://x.org/b">B</a><a href="/a">A again</a></body>"#,
        );
        let links = extract_links(&doc, "https://example.com/page");
        assert_eq!(links, vec!["https://example.com/a", "https://x.org/b"]);
    }

    #[test]
    fn test_parse_ahmia_results() {
        let doc = Html::parse_document(
            r#"<ol><li class="result"><h4><a href="/search/redirect?search_term=x&redirect_url=http://abc.onion/">Abc market</a></h4><p>Snippet here</p></li></ol>"#,
        );
        let results = parse_ahmia_results(&doc);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["url"], "http://abc.onion/");
        assert_eq!(results[0]["content"], "Snippet here");
    }

    #[test]
    fn test_tidy_text() {
        assert_eq!(tidy_text("a  \n\n\n\n  b\t\n"), "a\n\nb");
    }

    #[test]
    fn test_route_proxy_url() {
        assert_eq!(Route::Direct.proxy_url(), None);
        assert_eq!(
            Route::Socks(9050).proxy_url().as_deref(),
            Some("socks5h://127.0.0.1:9050")
        );
    }
}
