//! Result model shared by every codec and every formatter
//!
//! A [`ServerResult`] is owned by exactly one target. Codecs write into it
//! through the mutation API (`add_rule`, `get_or_create_player`,
//! [`Player::add_info`]) and the handful of well-known fields; formatters only
//! read it once the target is finished.

use crate::outcome::CodecError;
use log::debug;
use serde::{Deserialize, Serialize};

/// Upper bound on rules kept per target.
pub const MAX_RULES: usize = 4096;
/// Upper bound on players kept per target.
pub const MAX_PLAYERS: usize = 1024;

/// How `add_rule` treats a name that is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Always append; duplicate names are allowed.
    Append,
    /// Drop the new rule and report it as rejected.
    RejectDuplicate,
    /// Replace the stored value with the new one.
    OverwriteDuplicate,
    /// Silently keep the first value.
    #[default]
    KeepFirst,
}

/// What `add_rule` did with the rule it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleInsert {
    Appended,
    Overwritten,
    Rejected,
    Kept,
}

/// Server variable as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub name: String,
    pub value: String,
}

/// Protocol-specific per-player field with no common slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerInfo {
    pub key: String,
    pub value: String,
}

/// One player entry.
///
/// Only `number` and `name` are common to all protocols; the rest is filled
/// by codecs that know about it.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Player {
    pub number: i32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frags: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deaths: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    /// Seconds since the player connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<PlayerInfo>,
}

impl Player {
    pub fn new(number: i32) -> Self {
        Self {
            number,
            ..Default::default()
        }
    }

    /// Appends a protocol-specific key/value to this player's extension bag.
    pub fn add_info(&mut self, key: &str, value: &str) {
        self.info.push(PlayerInfo {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn info(&self, key: &str) -> Option<&str> {
        self.info
            .iter()
            .find(|i| i.key == key)
            .map(|i| i.value.as_str())
    }
}

/// Everything learned about one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerResult {
    pub name: Option<String>,
    pub map: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game: Option<String>,
    pub num_players: u32,
    pub max_players: u32,
    /// The status exchange never completed.
    pub missing_status: bool,
    /// Rules were requested but never arrived.
    pub missing_rules: bool,
    /// Players were requested but never arrived.
    pub missing_players: bool,
    rules: Vec<Rule>,
    players: Vec<Player>,
}

impl ServerResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule according to `policy`.
    ///
    /// Fails only when the per-target rule limit is reached.
    pub fn add_rule(
        &mut self,
        name: &str,
        value: &str,
        policy: DedupPolicy,
    ) -> Result<RuleInsert, CodecError> {
        if policy != DedupPolicy::Append {
            if let Some(existing) = self.rules.iter_mut().find(|r| r.name == name) {
                return Ok(match policy {
                    DedupPolicy::OverwriteDuplicate => {
                        existing.value = value.into();
                        RuleInsert::Overwritten
                    }
                    DedupPolicy::RejectDuplicate => {
                        debug!("Rejected duplicate rule {}", name);
                        RuleInsert::Rejected
                    }
                    _ => RuleInsert::Kept,
                });
            }
        }

        if self.rules.len() >= MAX_RULES {
            return Err(CodecError::Capacity(format!(
                "more than {} rules",
                MAX_RULES
            )));
        }

        self.rules.push(Rule {
            name: name.into(),
            value: value.into(),
        });
        Ok(RuleInsert::Appended)
    }

    /// First value stored under `name`.
    pub fn rule(&self, name: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.value.as_str())
    }

    /// Rules in insertion order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Returns the player with `number`, creating and appending it if absent.
    pub fn get_or_create_player(&mut self, number: i32) -> Result<&mut Player, CodecError> {
        match self.players.iter().position(|p| p.number == number) {
            Some(idx) => Ok(&mut self.players[idx]),
            None => self.add_player(Player::new(number)),
        }
    }

    /// Appends a player without checking for an existing number.
    pub fn add_player(&mut self, player: Player) -> Result<&mut Player, CodecError> {
        if self.players.len() >= MAX_PLAYERS {
            return Err(CodecError::Capacity(format!(
                "more than {} players",
                MAX_PLAYERS
            )));
        }

        self.players.push(player);
        let last = self.players.len() - 1;
        Ok(&mut self.players[last])
    }

    pub fn player(&self, number: i32) -> Option<&Player> {
        self.players.iter().find(|p| p.number == number)
    }

    /// Players in the order they were first seen.
    pub fn players(&self) -> &[Player] {
        &self.players
    }

    /// Whether any fact at all has been recorded.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.map.is_none() && self.rules.is_empty() && self.players.is_empty()
    }
}
