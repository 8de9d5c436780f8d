// name.rs - Interned entity names and the scope they resolve under
//
// A full entity name is `scene:local`. Scene files and expressions may use
// bare local names, which resolve against the surrounding EntityScope.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters that are never valid inside a name segment or signal name.
pub const INVALID_NAME_CHARS: &[char] = &['/', '#', ':', ',', '(', ')', ' '];

/// A `(scene, local)` entity name, unique per ECS instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    pub scene: String,
    pub local: String,
}

/// The context unqualified names resolve under (the owning scene).
pub type EntityScope = Name;

impl Name {
    pub fn new(scene: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            scene: scene.into(),
            local: local.into(),
        }
    }

    /// Parse `scene:local` or a bare `local` resolved against `scope`.
    ///
    /// Returns `None` for empty input, missing scene context, or invalid
    /// characters in either segment.
    pub fn parse(input: &str, scope: &EntityScope) -> Option<Name> {
        if input.is_empty() {
            return None;
        }
        let (scene, local) = match input.split_once(':') {
            Some((scene, local)) => (scene.to_string(), local.to_string()),
            None => (scope.scene.clone(), input.to_string()),
        };
        if scene.is_empty() || local.is_empty() {
            return None;
        }
        if local.contains(INVALID_NAME_CHARS) || scene.contains(INVALID_NAME_CHARS) {
            return None;
        }
        Some(Name { scene, local })
    }

    pub fn is_valid(&self) -> bool {
        !self.scene.is_empty() && !self.local.is_empty()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scene, self.local)
    }
}

impl Serialize for Name {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Name::parse(&s, &EntityScope::default())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid entity name: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolves_scope() {
        let scope = Name::new("hall", "");
        assert_eq!(Name::parse("door", &scope), Some(Name::new("hall", "door")));
        assert_eq!(
            Name::parse("lab:valve", &scope),
            Some(Name::new("lab", "valve"))
        );
        assert_eq!(Name::parse("", &scope), None);
        assert_eq!(Name::parse("door", &Name::default()), None);
        assert_eq!(Name::parse("bad name", &scope), None);
    }
}
