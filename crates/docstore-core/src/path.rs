use std::borrow::Cow;
use std::fmt;

/// One step in a [`FieldPath`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    /// The segment as a mapping key (indices are spelled in decimal).
    pub fn as_key(&self) -> Cow<'_, str> {
        match self {
            Segment::Key(k) => Cow::Borrowed(k.as_str()),
            Segment::Index(i) => Cow::Owned(i.to_string()),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(k) => f.write_str(k),
            Segment::Index(i) => write!(f, "{}", i),
        }
    }
}

/// Address of a node inside a document, e.g. `address.city` or `tags.2`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<Segment>);

impl FieldPath {
    /// The empty path (the document root).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a dot-separated path. All-digit segments become indices.
    pub fn parse(s: &str) -> Self {
        if s.is_empty() {
            return Self::root();
        }
        Self(
            s.split('.')
                .map(|part| match part.parse::<usize>() {
                    Ok(i) if part.bytes().all(|b| b.is_ascii_digit()) => Segment::Index(i),
                    _ => Segment::Key(part.to_string()),
                })
                .collect(),
        )
    }

    pub fn key(k: impl Into<String>) -> Self {
        Self(vec![Segment::Key(k.into())])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&Segment> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&Segment> {
        self.0.last()
    }

    pub fn parent(&self) -> Option<FieldPath> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// A new path with `key` appended.
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(Segment::Key(key.into()));
        Self(segments)
    }

    /// A new path with `index` appended.
    pub fn at(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(Segment::Index(index));
        Self(segments)
    }

    /// Whether `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        self.0.len() <= other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.as_key() == b.as_key())
    }

    /// Paths conflict when one addresses the other or one of its descendants.
    pub fn conflicts_with(&self, other: &FieldPath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl From<&str> for FieldPath {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<Vec<Segment>> for FieldPath {
    fn from(segments: Vec<Segment>) -> Self {
        Self(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = FieldPath::parse("address.lines.1");
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("address".into()),
                Segment::Key("lines".into()),
                Segment::Index(1)
            ]
        );
        assert_eq!(path.to_string(), "address.lines.1");
        assert_eq!(FieldPath::key("tags").at(0).to_string(), "tags.0");
    }

    #[test]
    fn test_signed_numbers_are_keys() {
        let path = FieldPath::parse("a.+1");
        assert_eq!(path.last(), Some(&Segment::Key("+1".into())));
    }

    #[test]
    fn test_conflicts() {
        let tags = FieldPath::parse("tags");
        assert!(tags.conflicts_with(&FieldPath::parse("tags.0")));
        assert!(FieldPath::parse("tags.0").conflicts_with(&tags));
        assert!(tags.conflicts_with(&tags));
        assert!(!tags.conflicts_with(&FieldPath::parse("tagline")));
        assert!(!tags.conflicts_with(&FieldPath::parse("name")));
    }
}
