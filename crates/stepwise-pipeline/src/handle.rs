//! Hierarchical node addressing.
//!
//! A [`NodeHandle`] is the path from the pipeline root to a node, one segment per
//! level of composite nesting (`outer.inner.leaf`). Ancestry is decided segment by
//! segment, so `ab` is never treated as an ancestor of `abc`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stepwise_types::{Result, StepwiseError};

pub const HANDLE_SEPARATOR: char = '.';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeHandle {
    segments: Vec<String>,
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl NodeHandle {
    /// Parse dotted handle text such as `outer.inner`.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(StepwiseError::MalformedHandle {
                text: text.to_string(),
                reason: "handle is empty".into(),
            });
        }
        let mut segments = Vec::new();
        for (idx, segment) in text.split(HANDLE_SEPARATOR).enumerate() {
            if segment.is_empty() {
                return Err(StepwiseError::MalformedHandle {
                    text: text.to_string(),
                    reason: format!("segment {} is empty", idx),
                });
            }
            if !is_valid_segment(segment) {
                return Err(StepwiseError::MalformedHandle {
                    text: text.to_string(),
                    reason: format!(
                        "segment '{}' may only contain letters, digits, '_' and '-'",
                        segment
                    ),
                });
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// A top-level handle with a single segment.
    pub fn root(name: &str) -> Result<Self> {
        Self::parse(name).and_then(|h| {
            if h.depth() == 1 {
                Ok(h)
            } else {
                Err(StepwiseError::MalformedHandle {
                    text: name.to_string(),
                    reason: "node names may not contain the separator".into(),
                })
            }
        })
    }

    /// Handle of a direct child of this node.
    pub fn child(&self, name: &str) -> Result<Self> {
        let child = Self::root(name)?;
        let mut segments = self.segments.clone();
        segments.extend(child.segments);
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// The last segment, i.e. the node's own name.
    pub fn name(&self) -> &str {
        // parse() never yields an empty handle
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// `true` if `self == ancestor` or `ancestor` is a proper prefix of `self`.
    pub fn is_or_descends_from(&self, ancestor: &NodeHandle) -> bool {
        self.segments.len() >= ancestor.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }

    pub fn to_text(&self) -> String {
        self.segments.join(".")
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromStr for NodeHandle {
    type Err = StepwiseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeHandle {
    type Error = StepwiseError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<NodeHandle> for String {
    fn from(handle: NodeHandle) -> Self {
        handle.to_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(text: &str) -> NodeHandle {
        NodeHandle::parse(text).unwrap()
    }

    #[test]
    fn parse_and_to_text_round_trip() {
        for text in ["a", "outer.inner", "x.y_2.z-3"] {
            assert_eq!(h(text).to_text(), text);
            assert_eq!(h(text).to_string(), text);
        }
    }

    #[test]
    fn parse_rejects_malformed_text() {
        for bad in ["", "  ", ".a", "a.", "a..b", "a b", "a/b"] {
            let err = NodeHandle::parse(bad).unwrap_err();
            assert!(
                matches!(err, StepwiseError::MalformedHandle { .. }),
                "expected MalformedHandle for {bad:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn descends_from_is_segment_wise() {
        assert!(h("outer.inner").is_or_descends_from(&h("outer")));
        assert!(h("outer").is_or_descends_from(&h("outer")));
        assert!(!h("outer").is_or_descends_from(&h("outer.inner")));
        assert!(!h("abc").is_or_descends_from(&h("ab")));
        assert!(!h("ab.c").is_or_descends_from(&h("a")));
    }

    #[test]
    fn parent_child_and_name() {
        let handle = h("outer.mid.leaf");
        assert_eq!(handle.name(), "leaf");
        assert_eq!(handle.depth(), 3);
        assert_eq!(handle.parent().unwrap(), h("outer.mid"));
        assert!(h("solo").parent().is_none());
        assert_eq!(h("outer").child("inner").unwrap(), h("outer.inner"));
        assert!(h("outer").child("in.ner").is_err());
    }

    #[test]
    fn serde_uses_dotted_text() {
        let json = serde_json::to_string(&h("outer.inner")).unwrap();
        assert_eq!(json, "\"outer.inner\"");
        let back: NodeHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h("outer.inner"));
        assert!(serde_json::from_str::<NodeHandle>("\"a..b\"").is_err());
    }
}
