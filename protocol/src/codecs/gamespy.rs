//! GameSpy v1 `\status\` query
//!
//! The reply is a flat `\key\value` string, usually spread over several
//! datagrams. Each datagram carries `\queryid\<id>.<n>` with its 1-based
//! number and the last one ends in `\final\`. Datagrams can arrive in any
//! order, so the target stays in progress until every number up to the final
//! one has been seen.
//!
//! Player names may contain backslashes. A backslash inside a `player_N`
//! value only ends the name when what follows looks like another key.

use crate::codec::{Capabilities, ParseContext, Phase, PhaseSet, ProtocolCodec, RequestParams, SessionState};
use crate::outcome::{CodecError, QueryOutcome};
use log::debug;

const STATUS_REQUEST: &[u8] = b"\\status\\";

/// Per-player keys, sent as `<field>_<number>`.
const PLAYER_FIELDS: &[&str] = &[
    "player", "frags", "deaths", "score", "ping", "team", "skin", "mesh", "face",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct GameSpy;

impl ProtocolCodec for GameSpy {
    fn id(&self) -> &'static str {
        "gamespy"
    }

    fn description(&self) -> &'static str {
        "GameSpy v1 status query"
    }

    fn default_port(&self) -> u16 {
        7778
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            challenge_gates: PhaseSet::EMPTY,
            status_includes: PhaseSet::of(&[Phase::Rules, Phase::Players]),
        }
    }

    fn build_request(
        &self,
        phase: Phase,
        _params: &RequestParams,
        _session: &SessionState,
    ) -> Result<Vec<u8>, CodecError> {
        match phase {
            Phase::Status => Ok(STATUS_REQUEST.to_vec()),
            other => Err(CodecError::Protocol(format!(
                "gamespy has no separate {} request",
                other
            ))),
        }
    }

    fn parse_response(&self, raw: &[u8], ctx: &mut ParseContext<'_>) -> QueryOutcome {
        match parse(raw, ctx) {
            Ok(outcome) => outcome,
            Err(err) => ctx.fail(err),
        }
    }
}

fn parse(raw: &[u8], ctx: &mut ParseContext<'_>) -> Result<QueryOutcome, CodecError> {
    ctx.accept(Phase::Status)?;

    let text = String::from_utf8_lossy(raw);
    let pairs = split_pairs(text.trim_end_matches(['\0', '\n']))?;

    let mut packet = 1u8;
    let mut is_final = false;
    for (key, value) in &pairs {
        match *key {
            "queryid" => packet = packet_number(value)?,
            "final" => is_final = true,
            _ => {}
        }
    }

    let bit = 1u64 << packet;
    if ctx.session.received_mask & bit != 0 {
        debug!("Duplicate gamespy packet {}", packet);
        return Ok(QueryOutcome::InProgress);
    }
    ctx.session.received_mask |= bit;
    if is_final {
        ctx.session.final_index = Some(packet);
    }

    for (key, value) in pairs {
        apply(key, value, ctx)?;
    }

    let Some(last) = ctx.session.final_index else {
        return Ok(QueryOutcome::InProgress);
    };
    let mask = ctx.session.received_mask;
    if (1..=last).all(|n| mask & (1u64 << n) != 0) {
        ctx.answer(Phase::Status);
        ctx.answer(Phase::Rules);
        ctx.answer(Phase::Players);
        Ok(QueryOutcome::DoneForce)
    } else {
        Ok(QueryOutcome::InProgress)
    }
}

/// Splits `\k\v\k\v...` into pairs, stopping at `\final\`.
fn split_pairs(text: &str) -> Result<Vec<(&str, &str)>, CodecError> {
    let mut rest = text
        .strip_prefix('\\')
        .ok_or_else(|| CodecError::Malformed("reply does not start with a backslash".into()))?;
    let mut pairs = Vec::new();

    while !rest.is_empty() {
        let (key, after) = rest.split_once('\\').unwrap_or((rest, ""));
        if key.is_empty() {
            return Err(CodecError::Malformed("empty key".into()));
        }
        if key == "final" {
            pairs.push((key, ""));
            break;
        }

        let end = if key.starts_with("player_") {
            name_end(after)
        } else {
            after.find('\\').unwrap_or(after.len())
        };
        pairs.push((key, &after[..end]));
        rest = after.get(end + 1..).unwrap_or("");
    }

    Ok(pairs)
}

/// Finds the backslash that ends a player name: the first one followed by a
/// token that looks like a key.
fn name_end(after: &str) -> usize {
    for (pos, _) in after.match_indices('\\') {
        let tail = &after[pos + 1..];
        let token = tail.split('\\').next().unwrap_or("");
        if is_key_token(token) {
            return pos;
        }
    }
    after.len()
}

fn is_key_token(token: &str) -> bool {
    if token == "final" || token == "queryid" {
        return true;
    }
    match token.rsplit_once('_') {
        Some((word, digits)) => {
            !word.is_empty()
                && !digits.is_empty()
                && word.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
                && digits.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Datagram number from `<id>.<n>`. A bare id counts as datagram 1.
fn packet_number(value: &str) -> Result<u8, CodecError> {
    let Some((_, number)) = value.split_once('.') else {
        return Ok(1);
    };
    match number.parse::<u8>() {
        Ok(n) if (1..64).contains(&n) => Ok(n),
        _ => Err(CodecError::Malformed(format!("bad queryid {}", value))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CodecError> {
    value
        .trim()
        .parse()
        .map_err(|_| CodecError::Malformed(format!("{} is not a number: {:?}", key, value)))
}

fn apply(key: &str, value: &str, ctx: &mut ParseContext<'_>) -> Result<(), CodecError> {
    match key {
        "queryid" | "final" => return Ok(()),
        "hostname" => ctx.result.name = Some(value.into()),
        "mapname" => ctx.result.map = Some(value.into()),
        "gamename" => ctx.result.game = Some(value.into()),
        "numplayers" => ctx.result.num_players = parse_number(key, value)?,
        "maxplayers" => ctx.result.max_players = parse_number(key, value)?,
        _ => {}
    }

    if let Some((field, number)) = key.rsplit_once('_') {
        if PLAYER_FIELDS.contains(&field) {
            if let Ok(number) = number.parse::<i32>() {
                return apply_player_field(field, number, value, ctx);
            }
        }
    }

    if !matches!(key, "hostname" | "mapname" | "gamename" | "numplayers" | "maxplayers") {
        ctx.add_rule(key, value)?;
    }
    Ok(())
}

fn apply_player_field(
    field: &str,
    number: i32,
    value: &str,
    ctx: &mut ParseContext<'_>,
) -> Result<(), CodecError> {
    let player = ctx.result.get_or_create_player(number)?;

    match field {
        "player" => player.name = value.into(),
        "frags" => player.frags = Some(parse_number(field, value)?),
        "deaths" => player.deaths = Some(parse_number(field, value)?),
        "score" => player.score = Some(parse_number(field, value)?),
        "ping" => player.ping = Some(parse_number(field, value)?),
        "team" => match value.trim().parse::<i32>() {
            Ok(team) => player.team = Some(team),
            Err(_) => player.team_name = Some(value.into()),
        },
        other => player.add_info(other, value),
    }

    Ok(())
}
