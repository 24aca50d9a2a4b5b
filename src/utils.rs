use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use url::Url;

/// Network resource categories a job may ask to block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    Xhr,
    Fetch,
    Websocket,
    Other,
}

impl ResourceKind {
    /// Map a browser-reported resource type onto a kind.
    pub fn from_browser_type(resource_type: &str) -> Self {
        match resource_type.to_ascii_lowercase().as_str() {
            "document" => ResourceKind::Document,
            "stylesheet" => ResourceKind::Stylesheet,
            "image" => ResourceKind::Image,
            "media" => ResourceKind::Media,
            "font" => ResourceKind::Font,
            "script" => ResourceKind::Script,
            "xhr" => ResourceKind::Xhr,
            "fetch" => ResourceKind::Fetch,
            "websocket" => ResourceKind::Websocket,
            _ => ResourceKind::Other,
        }
    }
}

/// Decides which intercepted requests get aborted.
///
/// The main document is never blocked, otherwise the page would not load at all.
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    blocked: BTreeSet<ResourceKind>,
}

impl ResourceFilter {
    pub fn new(blocked: BTreeSet<ResourceKind>) -> Self {
        let mut blocked = blocked;
        blocked.remove(&ResourceKind::Document);
        Self { blocked }
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }

    pub fn should_block(&self, kind: ResourceKind) -> bool {
        self.blocked.contains(&kind)
    }

    pub fn blocked(&self) -> &BTreeSet<ResourceKind> {
        &self.blocked
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Only http(s) URLs with a host may be rendered.
pub fn validate_url(url: &str) -> Result<Url, String> {
    let parsed = Url::parse(url).map_err(|e| e.to_string())?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(format!("unsupported scheme {scheme}")),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err("missing host".to_string());
    }

    Ok(parsed)
}

/// File extension for an artifact content type.
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}
