//! Mapping request resources onto filesystem paths.

use std::path::{Component, Path, PathBuf};

/// Turns a request resource into the path it is stored at.
pub trait Resolve: Send + Sync {
    fn resolve(&self, resource: &str) -> PathBuf;
}

/// Resolves resources under a root directory.
///
/// With isolation on, the resource is normalized lexically before joining:
/// leading separators are stripped, `.` is dropped and `..` never climbs
/// above the root. Without isolation the resource is joined as-is, so an
/// absolute resource or `..` can reach anywhere on the filesystem.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    isolate: bool,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>, isolate: bool) -> Self {
        Self {
            root: root.into(),
            isolate,
        }
    }
}

impl Resolve for PathResolver {
    fn resolve(&self, resource: &str) -> PathBuf {
        if !self.isolate {
            return self.root.join(resource);
        }

        let mut confined = PathBuf::new();
        for component in Path::new(resource).components() {
            match component {
                Component::Normal(part) => confined.push(part),
                Component::ParentDir => {
                    confined.pop();
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        self.root.join(confined)
    }
}
