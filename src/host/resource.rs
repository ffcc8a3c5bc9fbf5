use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use percent_encoding::percent_decode_str;
use tracing::{debug, info};
use url::Url;

use super::HostError;

/// A file served in place of a network response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub data: Vec<u8>,
    pub mime: String,
}

/// Serves `http`/`https` requests for bound domains from local directories.
#[derive(Default)]
pub struct ResourceLoader {
    bindings: RwLock<HashMap<String, PathBuf>>,
}

impl ResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `domain` (`"app.local"` or `"https://app.local"`) to `root`.
    pub fn bind(&self, domain: &str, root: impl Into<PathBuf>) -> Result<(), HostError> {
        let key = domain_key(domain)?;
        let root = root.into();
        info!(target: "resource", domain = %key, root = %root.display(), "domain bound");
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, root);
        Ok(())
    }

    pub fn unbind(&self, domain: &str) -> bool {
        let Ok(key) = domain_key(domain) else {
            return false;
        };
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .is_some()
    }

    pub fn is_bound(&self, domain: &str) -> bool {
        domain_key(domain).is_ok_and(|key| {
            self.bindings
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&key)
        })
    }

    /// The file behind `url`, if its host is bound and the file is readable.
    pub fn load(&self, url: &str) -> Option<Resource> {
        let parsed = Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let host = parsed.host_str()?.to_ascii_lowercase();
        let root = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&host)
            .cloned()?;

        let path = resolve_path(&root, &parsed)?;
        match fs::read(&path) {
            Ok(data) => {
                debug!(target: "resource", %url, path = %path.display(), bytes = data.len(), "serving local resource");
                Some(Resource {
                    mime: mime_guess::from_path(&path)
                        .first_or_octet_stream()
                        .essence_str()
                        .to_string(),
                    data,
                })
            }
            Err(err) => {
                debug!(target: "resource", %url, path = %path.display(), error = %err, "resource not readable");
                None
            }
        }
    }
}

fn domain_key(domain: &str) -> Result<String, HostError> {
    let trimmed = domain.trim();
    let key = match Url::parse(trimmed) {
        Ok(url) => url.host_str().map(str::to_string),
        Err(_) => Some(trimmed.trim_end_matches('/').to_string()),
    };
    match key {
        Some(key) if !key.is_empty() && !key.contains('/') => Ok(key.to_ascii_lowercase()),
        _ => Err(HostError::InvalidDomain(domain.to_string())),
    }
}

fn resolve_path(root: &Path, url: &Url) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    let mut last = String::new();
    for segment in url.path_segments()? {
        let segment = percent_decode_str(segment).decode_utf8().ok()?;
        if segment == ".." || segment.contains(&['/', '\\', '\0'][..]) {
            return None;
        }
        if !segment.is_empty() && segment != "." {
            path.push(&*segment);
        }
        last = segment.into_owned();
    }
    if last.is_empty() {
        path.push("index.html");
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn site() -> (TempDir, ResourceLoader) {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("index.html"), "<h1>hi</h1>").unwrap();
        fs::create_dir(root.path().join("js")).unwrap();
        fs::write(root.path().join("js/app.js"), "console.log(1)").unwrap();
        let loader = ResourceLoader::new();
        loader.bind("https://App.Local/", root.path()).unwrap();
        (root, loader)
    }

    #[test]
    fn serves_bound_http_urls() {
        let (_root, loader) = site();
        let index = loader.load("http://app.local/").unwrap();
        assert_eq!(index.mime, "text/html");
        assert_eq!(index.data, b"<h1>hi</h1>");

        let script = loader.load("https://app.local/js/app.js?v=2").unwrap();
        assert!(script.mime.ends_with("/javascript"), "{}", script.mime);
    }

    #[test]
    fn mime_types_follow_the_extension() {
        let (root, loader) = site();
        fs::write(root.path().join("clip.mp4"), [0u8; 4]).unwrap();
        fs::write(root.path().join("feed.xml"), "<feed/>").unwrap();
        fs::write(root.path().join("blob"), [1u8, 2]).unwrap();

        assert_eq!(loader.load("https://app.local/clip.mp4").unwrap().mime, "video/mp4");
        assert!(loader
            .load("https://app.local/feed.xml")
            .unwrap()
            .mime
            .ends_with("/xml"));
        assert_eq!(
            loader.load("https://app.local/blob").unwrap().mime,
            "application/octet-stream"
        );
    }

    #[test]
    fn escaped_segments_are_decoded() {
        let (root, loader) = site();
        fs::write(root.path().join("my file.html"), "spaced").unwrap();

        let page = loader.load("https://app.local/my%20file.html").unwrap();
        assert_eq!(page.data, b"spaced");
        assert_eq!(page.mime, "text/html");
    }

    #[test]
    fn escaped_traversal_is_rejected() {
        let (root, loader) = site();
        let outside = root.path().parent().unwrap().join("outside.txt");
        let _ = fs::write(&outside, "secret");

        assert!(loader.load("https://app.local/%2e%2e/outside.txt").is_none());
        assert!(loader.load("https://app.local/js%2F..%2F..%2Foutside.txt").is_none());
        assert!(loader.load("https://app.local/js%5C..%5Capp.js").is_none());
        assert!(loader.load("https://app.local/%FF.html").is_none());
        let _ = fs::remove_file(outside);
    }

    #[test]
    fn ignores_other_schemes_hosts_and_missing_files() {
        let (_root, loader) = site();
        assert!(loader.load("file://app.local/index.html").is_none());
        assert!(loader.load("https://other.local/index.html").is_none());
        assert!(loader.load("https://app.local/missing.css").is_none());
        assert!(loader.load("https://app.local/js/").is_none());
    }

    #[test]
    fn bare_domains_bind_and_unbind() {
        let loader = ResourceLoader::new();
        loader.bind("assets.local", "/srv/assets").unwrap();
        assert!(loader.is_bound("https://assets.local"));
        assert!(loader.unbind("assets.local"));
        assert!(!loader.is_bound("assets.local"));
        assert!(loader.bind("", "/srv").is_err());
    }
}
