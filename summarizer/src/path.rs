//! Node identity in the summarizer tree.
//!
//! Every node is addressed by a `/`-rooted path made of one component per
//! ancestor. The same string is used as the node id inside [crate::gc::GCData].

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::Error;

/// The separator between path components.
pub const SEPARATOR: char = '/';

/// Checks a node id for validity as a single path component.
/// We disallow slashes, null bytes, '.', '..' and the empty string.
pub fn is_valid_component(id: &str) -> bool {
    !id.is_empty() && id != ".." && id != "." && !id.contains('\0') && !id.contains(SEPARATOR)
}

pub(crate) fn validate_component(id: &str) -> Result<(), Error> {
    if is_valid_component(id) {
        Ok(())
    } else {
        Err(Error::InvalidNodeId(id.to_string()))
    }
}

/// A validated, absolute path of a node. The root path is `/`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodePath {
    inner: String,
}

impl NodePath {
    /// The path of the root node.
    pub fn root() -> Self {
        Self {
            inner: SEPARATOR.to_string(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.inner.len() == 1
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Returns the path of a child with the given id.
    pub fn join(&self, id: &str) -> Result<Self, Error> {
        validate_component(id)?;
        let mut inner = self.inner.clone();
        if !self.is_root() {
            inner.push(SEPARATOR);
        }
        inner.push_str(id);
        Ok(Self { inner })
    }

    /// Returns the parent path, or None for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let (parent, _) = self.inner.rsplit_once(SEPARATOR)?;
        Some(if parent.is_empty() {
            Self::root()
        } else {
            Self {
                inner: parent.to_string(),
            }
        })
    }

    /// Iterates over the components, the root path has none.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.inner.split(SEPARATOR).filter(|c| !c.is_empty())
    }
}

impl FromStr for NodePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SEPARATOR)
            .ok_or_else(|| Error::InvalidNodeId(s.to_string()))?;

        let mut path = NodePath::root();
        if rest.is_empty() {
            return Ok(path);
        }
        for component in rest.split(SEPARATOR) {
            path = path.join(component)?;
        }
        Ok(path)
    }
}

impl AsRef<str> for NodePath {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

/// Rewrites a node id relative to a child (where `/` is the child itself) into
/// an id relative to its parent.
pub fn prefix_node_id(prefix: &str, id: &str) -> String {
    let rest = id.trim_start_matches(SEPARATOR);
    if rest.is_empty() {
        format!("{SEPARATOR}{prefix}")
    } else {
        format!("{SEPARATOR}{prefix}{SEPARATOR}{rest}")
    }
}

#[cfg(test)]
mod tests {
    use super::{prefix_node_id, NodePath};
    use rstest::rstest;

    #[rstest]
    #[case::root("/", Some(vec![]))]
    #[case::single("/default", Some(vec!["default"]))]
    #[case::nested("/default/root", Some(vec!["default", "root"]))]
    #[case::relative("default", None)]
    #[case::empty("", None)]
    #[case::trailing_slash("/default/", None)]
    #[case::double_slash("//default", None)]
    #[case::dotdot("/default/..", None)]
    fn parse(#[case] s: &str, #[case] exp_components: Option<Vec<&str>>) {
        match exp_components {
            Some(components) => {
                let path: NodePath = s.parse().expect("must parse");
                assert_eq!(components, path.components().collect::<Vec<_>>());
                assert_eq!(s, path.to_string());
            }
            None => {
                s.parse::<NodePath>().expect_err("must fail");
            }
        }
    }

    #[test]
    fn join_and_parent() {
        let root = NodePath::root();
        let ds = root.join("default").unwrap();
        let channel = ds.join("root").unwrap();

        assert_eq!("/default/root", channel.as_str());
        assert_eq!(Some(ds.clone()), channel.parent());
        assert_eq!(Some(root.clone()), ds.parent());
        assert_eq!(None, root.parent());

        root.join("a/b").expect_err("slash must be rejected");
        root.join("").expect_err("empty id must be rejected");
    }

    #[rstest]
    #[case::self_node("/", "/default")]
    #[case::sub_node("/root", "/default/root")]
    #[case::no_leading_slash("root", "/default/root")]
    fn prefix(#[case] id: &str, #[case] expected: &str) {
        assert_eq!(expected, prefix_node_id("default", id));
    }
}
