use crate::FetchError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Somewhere artifact bytes can be fetched from.
pub trait ArtifactSource: Send + Sync {
    /// Fetch the whole resource at `location`.
    fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError>;
}

/// Plain `http://` and `https://` downloads.
pub struct HttpSource {
    agent: ureq::Agent,
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection establishment limit for artifact downloads.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Whole-request limit, including the body.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

impl HttpSource {
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT, DOWNLOAD_TIMEOUT)
    }

    /// A stalled server fails the fetch once either limit passes.
    pub fn with_timeouts(connect: Duration, total: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_connect(Some(connect))
            .timeout_global(Some(total))
            .build();
        Self {
            agent: config.into(),
        }
    }
}

impl ArtifactSource for HttpSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        tracing::debug!("GET {url}");
        let resp = match self
            .agent
            .get(url)
            .header("User-Agent", concat!("docket/", env!("CARGO_PKG_VERSION")))
            .call()
        {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(FetchError::NotFound(url.to_owned()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(FetchError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => {
                return Err(FetchError::Http(format!("{url}: {e}")));
            }
        };

        let code = resp.status().as_u16();
        if code == 404 {
            return Err(FetchError::NotFound(url.to_owned()));
        }
        if code >= 400 {
            return Err(FetchError::Http(format!("HTTP {code} for {url}")));
        }

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| FetchError::Http(format!("{url}: {e}")))?;
        tracing::debug!("GET {url}: {} bytes", body.len());
        Ok(body)
    }
}

/// `file://` URLs and absolute paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSource;

impl FileSource {
    fn path_of(location: &str) -> Option<&Path> {
        let raw = location.strip_prefix("file://").unwrap_or(location);
        let path = Path::new(raw);
        path.is_absolute().then_some(path)
    }
}

impl ArtifactSource for FileSource {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        let path = Self::path_of(location)
            .ok_or_else(|| FetchError::UnsupportedSource(location.to_owned()))?;
        tracing::debug!("reading {}", path.display());
        match std::fs::read(path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(location.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Offline mirror: every location is served from `<root>/<last path segment>`.
#[derive(Debug, Clone)]
pub struct MirrorSource {
    root: PathBuf,
}

impl MirrorSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn mirrored_path(&self, location: &str) -> Option<PathBuf> {
        let without_query = location.split(['?', '#']).next().unwrap_or(location);
        let name = without_query.rsplit('/').next()?;
        if name.is_empty() || name == "." || name == ".." {
            return None;
        }
        Some(self.root.join(name))
    }
}

impl ArtifactSource for MirrorSource {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        let path = self
            .mirrored_path(location)
            .ok_or_else(|| FetchError::UnsupportedSource(location.to_owned()))?;
        tracing::debug!("mirror: {location} -> {}", path.display());
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound(
                format!("{location} (mirror path {})", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

/// Picks a source by location scheme; with a mirror configured, everything goes to the mirror.
pub struct SourceRouter {
    http: HttpSource,
    file: FileSource,
    mirror: Option<MirrorSource>,
}

impl Default for SourceRouter {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SourceRouter {
    pub fn new(mirror: Option<MirrorSource>) -> Self {
        Self {
            http: HttpSource::new(),
            file: FileSource,
            mirror,
        }
    }
}

impl ArtifactSource for SourceRouter {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(mirror) = &self.mirror {
            return mirror.fetch(location);
        }
        if location.starts_with("http://") || location.starts_with("https://") {
            self.http.fetch(location)
        } else {
            self.file.fetch(location)
        }
    }
}
