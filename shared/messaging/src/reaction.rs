use crate::message::Receivable;
use crate::{ModelError, Result};
use serde::{Deserialize, Serialize};

/// The six reactions the host messaging application supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReactionKind {
    Love,
    Like,
    Dislike,
    Laugh,
    Emphasize,
    Question,
}

impl ReactionKind {
    pub const ALL: [ReactionKind; 6] = [
        ReactionKind::Love,
        ReactionKind::Like,
        ReactionKind::Dislike,
        ReactionKind::Laugh,
        ReactionKind::Emphasize,
        ReactionKind::Question,
    ];

    fn offset(self) -> i64 {
        match self {
            ReactionKind::Love => 0,
            ReactionKind::Like => 1,
            ReactionKind::Dislike => 2,
            ReactionKind::Laugh => 3,
            ReactionKind::Emphasize => 4,
            ReactionKind::Question => 5,
        }
    }
}

/// A reaction code: an addition (2000..=2005) or its paired removal (+1000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct ReactionType {
    kind: ReactionKind,
    removal: bool,
}

impl ReactionType {
    pub const ADDITION_BASE: i64 = 2000;
    pub const REMOVAL_BASE: i64 = 3000;

    pub fn addition(kind: ReactionKind) -> Self {
        Self {
            kind,
            removal: false,
        }
    }

    pub fn removal(kind: ReactionKind) -> Self {
        Self {
            kind,
            removal: true,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        let (base, removal) = if (Self::REMOVAL_BASE..Self::REMOVAL_BASE + 6).contains(&code) {
            (Self::REMOVAL_BASE, true)
        } else if (Self::ADDITION_BASE..Self::ADDITION_BASE + 6).contains(&code) {
            (Self::ADDITION_BASE, false)
        } else {
            return Err(ModelError::UnknownReactionCode(code));
        };
        let kind = ReactionKind::ALL[(code - base) as usize];
        Ok(Self { kind, removal })
    }

    pub fn code(&self) -> i64 {
        let base = if self.removal {
            Self::REMOVAL_BASE
        } else {
            Self::ADDITION_BASE
        };
        base + self.kind.offset()
    }

    /// Additions and removals of the same emotion share a class.
    pub fn class(&self) -> i64 {
        self.code() % 1000
    }

    pub fn kind(&self) -> ReactionKind {
        self.kind
    }

    pub fn is_addition(&self) -> bool {
        !self.removal
    }
}

impl TryFrom<i64> for ReactionType {
    type Error = ModelError;

    fn try_from(code: i64) -> Result<Self> {
        Self::from_code(code)
    }
}

impl From<ReactionType> for i64 {
    fn from(value: ReactionType) -> Self {
        value.code()
    }
}

/// A reaction event attached to a message (or one text part of it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    rowid: i64,
    date: i64,
    target_message_id: i64,
    reaction_type: ReactionType,
    pub guid: String,
    pub handle_id: i64,
    pub handle_name: String,
    pub is_from_me: bool,
    /// Index of the text part the reaction addresses (`p:N/` in the source guid).
    pub target_part: u32,
    pub text: Option<String>,
}

impl Reaction {
    pub fn new(rowid: i64, target_message_id: i64, reaction_type: ReactionType, date: i64) -> Self {
        Self {
            rowid,
            date,
            target_message_id,
            reaction_type,
            guid: String::new(),
            handle_id: 0,
            handle_name: String::new(),
            is_from_me: false,
            target_part: 0,
            text: None,
        }
    }

    pub fn with_handle(mut self, handle_id: i64, handle_name: impl Into<String>) -> Self {
        self.handle_id = handle_id;
        self.handle_name = handle_name.into();
        self
    }

    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = guid.into();
        self
    }

    pub fn with_target_part(mut self, part: u32) -> Self {
        self.target_part = part;
        self
    }

    pub fn target_message_id(&self) -> i64 {
        self.target_message_id
    }

    pub fn reaction_type(&self) -> ReactionType {
        self.reaction_type
    }

    pub fn class(&self) -> i64 {
        self.reaction_type.class()
    }

    pub fn is_addition(&self) -> bool {
        self.reaction_type.is_addition()
    }

    pub fn is_removal(&self) -> bool {
        !self.is_addition()
    }
}

impl Receivable for Reaction {
    fn rowid(&self) -> i64 {
        self.rowid
    }

    fn date(&self) -> i64 {
        self.date
    }

    // Reaction rows never change once written upstream.
    fn merge(&mut self, _newer: &Self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_classes() {
        for kind in ReactionKind::ALL {
            let add = ReactionType::addition(kind);
            let remove = ReactionType::removal(kind);
            assert_eq!(remove.code(), add.code() + 1000);
            assert_eq!(add.class(), remove.class());
            assert_eq!(ReactionType::from_code(add.code()).unwrap(), add);
            assert_eq!(ReactionType::from_code(remove.code()).unwrap(), remove);
        }
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert_eq!(
            ReactionType::from_code(2006),
            Err(ModelError::UnknownReactionCode(2006))
        );
        assert!(ReactionType::from_code(1000).is_err());
        assert!(ReactionType::from_code(0).is_err());
    }

    #[test]
    fn removal_code_is_not_an_addition() {
        let reaction = Reaction::new(1393, 1, ReactionType::from_code(3004).unwrap(), 10);
        assert!(reaction.is_removal());
        assert_eq!(reaction.class(), 4);
        assert_eq!(reaction.reaction_type().kind(), ReactionKind::Emphasize);
    }

    #[test]
    fn reaction_type_serializes_as_code() {
        let json = serde_json::to_string(&ReactionType::addition(ReactionKind::Laugh)).unwrap();
        assert_eq!(json, "2003");
        let parsed: ReactionType = serde_json::from_str("3001").unwrap();
        assert_eq!(parsed, ReactionType::removal(ReactionKind::Like));
        assert!(serde_json::from_str::<ReactionType>("42").is_err());
    }
}
