//! Addressing helper shared by all backends.
//!
//! A location is either a filesystem path or a URI. Both forms support the same navigation
//! (`parent`, `child`, `basename`) so backends compose a `Location` instead of implementing
//! their own path arithmetic.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Path(std::path::PathBuf),
    Uri(url::Url),
}

impl Location {
    /// Anything with a `scheme://` prefix is a URI, everything else is a path.
    pub fn parse(location: &str) -> Result<Self> {
        if location.contains("://") {
            let uri = url::Url::parse(location)
                .map_err(|err| anyhow::anyhow!("invalid location {location:?}: {err}"))?;
            if uri.cannot_be_a_base() {
                return Err(Error::UnsupportedLocation(location.to_string()));
            }
            Ok(Location::Uri(uri))
        } else {
            Ok(Location::Path(std::path::PathBuf::from(location)))
        }
    }

    pub fn scheme(&self) -> &str {
        match self {
            Location::Path(_) => "file",
            Location::Uri(uri) => uri.scheme(),
        }
    }

    pub fn as_path(&self) -> Option<&std::path::Path> {
        match self {
            Location::Path(path) => Some(path),
            Location::Uri(_) => None,
        }
    }

    /// Host part of a URI (e.g. the bucket of a blob store).
    pub fn host(&self) -> Option<&str> {
        match self {
            Location::Path(_) => None,
            Location::Uri(uri) => uri.host_str(),
        }
    }

    /// Path segments below the host, empty segments removed.
    pub fn segments(&self) -> Vec<String> {
        match self {
            Location::Path(path) => path
                .components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(name) => Some(name.to_string_lossy().to_string()),
                    _ => None,
                })
                .collect(),
            Location::Uri(uri) => uri
                .path_segments()
                .map(|segments| {
                    segments
                        .filter(|s| !s.is_empty())
                        .map(decode_segment)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn basename(&self) -> Option<String> {
        match self {
            Location::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
            Location::Uri(_) => self.segments().pop(),
        }
    }

    /// `None` at the root.
    pub fn parent(&self) -> Option<Location> {
        match self {
            Location::Path(path) => path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(|parent| Location::Path(parent.to_path_buf())),
            Location::Uri(uri) => {
                let mut segments = self.segments();
                segments.pop()?;
                let mut parent = uri.clone();
                set_segments(&mut parent, &segments);
                Some(Location::Uri(parent))
            }
        }
    }

    pub fn child(&self, name: &str) -> Location {
        match self {
            Location::Path(path) => Location::Path(path.join(name)),
            Location::Uri(uri) => {
                let mut segments = self.segments();
                segments.push(name.to_string());
                let mut child = uri.clone();
                set_segments(&mut child, &segments);
                Location::Uri(child)
            }
        }
    }

    /// Sibling whose name is this location's name followed by `suffix`.
    pub fn with_suffix(&self, suffix: &str) -> Location {
        let name = format!("{}{}", self.basename().unwrap_or_default(), suffix);
        match self.parent() {
            Some(parent) => parent.child(&name),
            None => self.child(&name),
        }
    }
}

fn decode_segment(segment: &str) -> String {
    url::form_urlencoded::parse(format!("s={}", segment.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, value)| value.to_string())
        .unwrap_or_else(|| segment.to_string())
}

fn set_segments(uri: &mut url::Url, segments: &[String]) {
    uri.set_path("/");
    if let Ok(mut path) = uri.path_segments_mut() {
        path.clear();
        path.extend(segments);
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Location::Path(path) => write!(f, "{}", path.display()),
            Location::Uri(uri) => write!(f, "{uri}"),
        }
    }
}
