use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Absolute, slash separated location in the store's namespace.
///
/// Validated on construction: must start with `/`, must not end with `/`
/// (except the root itself) and must not contain empty, `.` or `..`
/// segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePath(String);

impl NodePath {
    pub const ROOT: &'static str = "/";

    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate(&path)?;
        Ok(Self(path))
    }

    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    /// Parent node, `None` for the root.
    pub fn parent(&self) -> Option<NodePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Appends a single segment.
    pub fn child(
        &self,
        name: &str,
    ) -> Result<NodePath> {
        if self.is_root() {
            NodePath::new(format!("/{name}"))
        } else {
            NodePath::new(format!("{}/{name}", self.0))
        }
    }
}

fn validate(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(format!("{path:?} must start with '/'")));
    }
    if path == NodePath::ROOT {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(Error::InvalidPath(format!("{path:?} must not end with '/'")));
    }
    if path.contains('\0') {
        return Err(Error::InvalidPath(format!("{path:?} contains a null character")));
    }
    for segment in path[1..].split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(Error::InvalidPath(format!("{path:?} has an invalid segment {segment:?}")));
        }
    }
    Ok(())
}

impl fmt::Display for NodePath {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for NodePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NodePath::new(s)
    }
}

impl TryFrom<&str> for NodePath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        NodePath::new(value)
    }
}

impl TryFrom<String> for NodePath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        NodePath::new(value)
    }
}
