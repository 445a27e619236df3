use std::fmt;
use std::str::FromStr;

/// A parsed `owner/entity/action` reference naming a backend operation.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Target {
    pub owner: String,
    pub entity: String,
    pub action: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed target {raw:?}: expected \"owner/entity/action\"")]
pub struct TargetError {
    pub raw: String,
}

impl Target {
    pub fn new(
        owner: impl Into<String>,
        entity: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            entity: entity.into(),
            action: action.into(),
        }
    }

    /// Split on `/` into exactly three non-empty parts.
    pub fn parse(raw: &str) -> Result<Self, TargetError> {
        let mut parts = raw.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(entity), Some(action), None)
                if !owner.is_empty() && !entity.is_empty() && !action.is_empty() =>
            {
                Ok(Self::new(owner, entity, action))
            }
            _ => Err(TargetError { raw: raw.to_string() }),
        }
    }
}

impl FromStr for Target {
    type Err = TargetError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.entity, self.action)
    }
}
