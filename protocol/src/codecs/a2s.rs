//! Source / GoldSrc server query (A2S)
//!
//! Every datagram starts with a 4-byte little-endian marker: `-1` for a
//! self-contained reply, `-2` for one fragment of a split reply. Single replies
//! carry a type byte:
//!
//! | byte | reply                     |
//! |------|---------------------------|
//! | `A`  | challenge token           |
//! | `I`  | info (Source or compact)  |
//! | `m`  | info (GoldSrc)            |
//! | `E`  | rules                     |
//! | `D`  | players                   |
//!
//! Split replies carry a 4-byte series id followed by the fragment position.
//! GoldSrc packs `index << 4 | count` into one byte; Source sends a count byte,
//! an index byte and the 2-byte split size. Which form a server uses is
//! learned from its info reply and stored as the session revision.
//!
//! Rules and players are gated by a challenge: the client first asks for
//! players with token `-1`, receives `A` + token, and echoes the token in the
//! rules and players requests. A server that answers any other request with
//! `A` gets that request re-sent with the fresh token.

use crate::codec::{Capabilities, ParseContext, Phase, PhaseSet, ProtocolCodec, RequestParams, SessionState};
use crate::model::Player;
use crate::outcome::{CodecError, QueryOutcome};
use crate::wire::WireCursor;
use log::debug;

const SINGLE_PACKET: i32 = -1;
const SPLIT_PACKET: i32 = -2;
const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

const A2S_INFO: u8 = 0x54;
const A2S_PLAYER: u8 = 0x55;
const A2S_RULES: u8 = 0x56;
const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";

const S2C_CHALLENGE: u8 = 0x41;
const S2A_INFO_SOURCE: u8 = 0x49;
const S2A_INFO_GOLDSRC: u8 = 0x6D;
const S2A_RULES: u8 = 0x45;
const S2A_PLAYER: u8 = 0x44;

/// Split header is one packed byte.
pub const REVISION_GOLDSRC: u8 = 1;
/// Split header is count, index and a 2-byte size.
pub const REVISION_SOURCE: u8 = 2;

const COMPRESSED_SPLIT: u32 = 0x8000_0000;
const THE_SHIP_APP_ID: u16 = 2400;

const EDF_PORT: u8 = 0x80;
const EDF_STEAM_ID: u8 = 0x10;
const EDF_SOURCE_TV: u8 = 0x40;
const EDF_KEYWORDS: u8 = 0x20;
const EDF_GAME_ID: u8 = 0x01;

#[derive(Debug, Default, Clone, Copy)]
pub struct A2s;

impl ProtocolCodec for A2s {
    fn id(&self) -> &'static str {
        "a2s"
    }

    fn description(&self) -> &'static str {
        "Source / GoldSrc server query"
    }

    fn default_port(&self) -> u16 {
        27015
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            challenge_gates: PhaseSet::of(&[Phase::Rules, Phase::Players]),
            status_includes: PhaseSet::EMPTY,
        }
    }

    fn build_request(
        &self,
        phase: Phase,
        _params: &RequestParams,
        session: &SessionState,
    ) -> Result<Vec<u8>, CodecError> {
        let token = session.challenge.unwrap_or(-1).to_le_bytes();

        let packet = match phase {
            Phase::Challenge => [&HEADER[..], &[A2S_PLAYER], &(-1i32).to_le_bytes()].concat(),
            Phase::Status => {
                let mut packet = [&HEADER[..], &[A2S_INFO], INFO_PAYLOAD].concat();
                if session.challenge.is_some() {
                    packet.extend_from_slice(&token);
                }
                packet
            }
            Phase::Rules => [&HEADER[..], &[A2S_RULES], &token].concat(),
            Phase::Players => [&HEADER[..], &[A2S_PLAYER], &token].concat(),
        };

        Ok(packet)
    }

    fn parse_response(&self, raw: &[u8], ctx: &mut ParseContext<'_>) -> QueryOutcome {
        match parse(raw, ctx) {
            Ok(outcome) => outcome,
            Err(err) => ctx.fail(err),
        }
    }
}

fn parse(raw: &[u8], ctx: &mut ParseContext<'_>) -> Result<QueryOutcome, CodecError> {
    let mut cursor = WireCursor::new(raw);

    match cursor.read_i32_le()? {
        SINGLE_PACKET => {}
        SPLIT_PACKET => return parse_split(&mut cursor, ctx),
        other => {
            return Err(CodecError::Protocol(format!(
                "unknown packet marker {:#010x}",
                other
            )))
        }
    }

    match cursor.read_u8()? {
        S2C_CHALLENGE => parse_challenge(&mut cursor, ctx),
        S2A_INFO_SOURCE => {
            ctx.accept(Phase::Status)?;
            parse_source_info(&mut cursor, ctx)?;
            ctx.session.revision = Some(REVISION_SOURCE);
            ctx.answer(Phase::Status);
            Ok(QueryOutcome::DoneForce)
        }
        S2A_INFO_GOLDSRC => {
            ctx.accept(Phase::Status)?;
            parse_goldsrc_info(&mut cursor, ctx)?;
            ctx.session.revision = Some(REVISION_GOLDSRC);
            ctx.answer(Phase::Status);
            Ok(QueryOutcome::DoneForce)
        }
        S2A_RULES => {
            ctx.accept(Phase::Rules)?;
            parse_rules(&mut cursor, ctx)?;
            ctx.answer(Phase::Rules);
            Ok(QueryOutcome::DoneForce)
        }
        S2A_PLAYER => {
            ctx.accept(Phase::Players)?;
            parse_players(&mut cursor, ctx)?;
            ctx.answer(Phase::Players);
            Ok(QueryOutcome::DoneForce)
        }
        other => Err(CodecError::UnknownType(other)),
    }
}

fn parse_split(cursor: &mut WireCursor<'_>, ctx: &mut ParseContext<'_>) -> Result<QueryOutcome, CodecError> {
    let series_id = cursor.read_u32_le()?;
    if series_id & COMPRESSED_SPLIT != 0 {
        return Err(CodecError::Protocol(
            "compressed split replies are not supported".into(),
        ));
    }

    let (index, count) = match ctx.session.revision {
        Some(REVISION_GOLDSRC) => {
            let packed = cursor.read_u8()?;
            ((packed >> 4) as usize, (packed & 0x0F) as usize)
        }
        _ => {
            let count = cursor.read_u8()? as usize;
            let index = cursor.read_u8()? as usize;
            let _split_size = cursor.read_u16_le()?;
            (index, count)
        }
    };

    if count == 0 || index >= count {
        return Err(CodecError::Malformed(format!(
            "split fragment {} of {} is out of range",
            index, count
        )));
    }

    debug!("Split fragment {}/{} of series {:#010x}", index + 1, count, series_id);
    Ok(ctx.ingest_fragment(series_id, index, count, cursor.read_rest()))
}

fn parse_challenge(cursor: &mut WireCursor<'_>, ctx: &mut ParseContext<'_>) -> Result<QueryOutcome, CodecError> {
    let token = cursor.read_i32_le()?;

    if ctx.current() == Some(Phase::Challenge) {
        ctx.accept(Phase::Challenge)?;
        ctx.session.challenge = Some(token);
        ctx.answer(Phase::Challenge);
        return Ok(QueryOutcome::DoneForce);
    }

    // A repeat of the token we already hold answers nothing
    if ctx.session.challenge == Some(token) {
        return Err(CodecError::Unexpected(Phase::Challenge.name()));
    }
    ctx.session.challenge = Some(token);

    // The server wants a token for whatever we just asked for
    debug!("Challenge {:#010x} received mid-phase, re-sending", token);
    ctx.request_resend();
    Ok(QueryOutcome::InProgress)
}

fn dedicated_flag(server_type: u8) -> &'static str {
    match server_type {
        b'd' | b'D' | b'p' | b'P' => "1",
        _ => "0",
    }
}

fn os_name(environment: u8) -> Option<&'static str> {
    match environment {
        b'l' | b'L' => Some("linux"),
        b'w' | b'W' => Some("windows"),
        b'm' | b'M' | b'o' | b'O' => Some("mac"),
        _ => None,
    }
}

fn parse_source_info(cursor: &mut WireCursor<'_>, ctx: &mut ParseContext<'_>) -> Result<(), CodecError> {
    let protocol = cursor.read_u8()?;
    let name = cursor.read_cstring()?;
    let map = cursor.read_cstring()?;

    if protocol == 0 {
        // Compact layout: counts, version and server flags follow the map
        let num_players = cursor.read_u8()?;
        let max_players = cursor.read_u8()?;
        let version = cursor.read_u8()?;
        let server_type = cursor.read_u8()?;
        let environment = cursor.read_u8()?;

        ctx.result.name = Some(name);
        ctx.result.map = Some(map);
        ctx.result.num_players = num_players as u32;
        ctx.result.max_players = max_players as u32;
        ctx.add_rule("version", &version.to_string())?;
        ctx.add_rule("dedicated", dedicated_flag(server_type))?;
        if let Some(os) = os_name(environment) {
            ctx.add_rule("sv_os", os)?;
        }
        return Ok(());
    }

    let folder = cursor.read_cstring()?;
    let game = cursor.read_cstring()?;
    let app_id = cursor.read_u16_le()?;
    let num_players = cursor.read_u8()?;
    let max_players = cursor.read_u8()?;
    let bots = cursor.read_u8()?;
    let server_type = cursor.read_u8()?;
    let environment = cursor.read_u8()?;
    let visibility = cursor.read_u8()?;
    let vac = cursor.read_u8()?;
    if app_id == THE_SHIP_APP_ID {
        cursor.skip(3)?;
    }
    let version = cursor.read_cstring()?;

    ctx.result.name = Some(name);
    ctx.result.map = Some(map);
    ctx.result.game = Some(game.clone());
    ctx.result.num_players = num_players as u32;
    ctx.result.max_players = max_players as u32;

    ctx.add_rule("protocol", &protocol.to_string())?;
    ctx.add_rule("gamedir", &folder)?;
    ctx.add_rule("gamename", &game)?;
    ctx.add_rule("appid", &app_id.to_string())?;
    ctx.add_rule("bots", &bots.to_string())?;
    ctx.add_rule("dedicated", dedicated_flag(server_type))?;
    if let Some(os) = os_name(environment) {
        ctx.add_rule("sv_os", os)?;
    }
    ctx.add_rule("password", &visibility.to_string())?;
    ctx.add_rule("secure", &vac.to_string())?;
    ctx.add_rule("version", &version)?;

    let Some(edf) = cursor.peek_u8() else {
        return Ok(());
    };
    cursor.skip(1)?;

    if edf & EDF_PORT != 0 {
        ctx.add_rule("game_port", &cursor.read_u16_le()?.to_string())?;
    }
    if edf & EDF_STEAM_ID != 0 {
        ctx.add_rule("steamid", &cursor.read_u64_le()?.to_string())?;
    }
    if edf & EDF_SOURCE_TV != 0 {
        ctx.add_rule("sourcetv_port", &cursor.read_u16_le()?.to_string())?;
        ctx.add_rule("sourcetv_name", &cursor.read_cstring()?)?;
    }
    if edf & EDF_KEYWORDS != 0 {
        ctx.add_rule("keywords", &cursor.read_cstring()?)?;
    }
    if edf & EDF_GAME_ID != 0 {
        ctx.add_rule("gameid", &cursor.read_u64_le()?.to_string())?;
    }

    Ok(())
}

fn parse_goldsrc_info(cursor: &mut WireCursor<'_>, ctx: &mut ParseContext<'_>) -> Result<(), CodecError> {
    let _address = cursor.read_cstring()?;
    let name = cursor.read_cstring()?;
    let map = cursor.read_cstring()?;
    let folder = cursor.read_cstring()?;
    let game = cursor.read_cstring()?;
    let num_players = cursor.read_u8()?;
    let max_players = cursor.read_u8()?;
    let protocol = cursor.read_u8()?;
    let server_type = cursor.read_u8()?;
    let environment = cursor.read_u8()?;
    let visibility = cursor.read_u8()?;
    let is_mod = cursor.read_u8()?;

    ctx.result.name = Some(name);
    ctx.result.map = Some(map);
    ctx.result.game = Some(game.clone());
    ctx.result.num_players = num_players as u32;
    ctx.result.max_players = max_players as u32;

    ctx.add_rule("protocol", &protocol.to_string())?;
    ctx.add_rule("gamedir", &folder)?;
    ctx.add_rule("gamename", &game)?;
    ctx.add_rule("dedicated", dedicated_flag(server_type))?;
    if let Some(os) = os_name(environment) {
        ctx.add_rule("sv_os", os)?;
    }
    ctx.add_rule("password", &visibility.to_string())?;

    if is_mod == 1 {
        ctx.add_rule("mod_link", &cursor.read_cstring()?)?;
        ctx.add_rule("mod_download", &cursor.read_cstring()?)?;
        cursor.skip(1)?;
        ctx.add_rule("mod_version", &cursor.read_u32_le()?.to_string())?;
        ctx.add_rule("mod_size", &cursor.read_u32_le()?.to_string())?;
        ctx.add_rule("mod_server_only", &cursor.read_u8()?.to_string())?;
        ctx.add_rule("mod_custom_dll", &cursor.read_u8()?.to_string())?;
    }

    ctx.add_rule("secure", &cursor.read_u8()?.to_string())?;
    ctx.add_rule("bots", &cursor.read_u8()?.to_string())?;

    Ok(())
}

fn parse_rules(cursor: &mut WireCursor<'_>, ctx: &mut ParseContext<'_>) -> Result<(), CodecError> {
    let count = cursor.read_u16_le()?;

    for _ in 0..count {
        let name = cursor.read_cstring()?;
        let value = cursor.read_cstring()?;
        ctx.add_rule(&name, &value)?;
    }

    Ok(())
}

fn parse_players(cursor: &mut WireCursor<'_>, ctx: &mut ParseContext<'_>) -> Result<(), CodecError> {
    let count = cursor.read_u8()?;

    for _ in 0..count {
        let _index = cursor.read_u8()?;
        let name = cursor.read_cstring()?;
        let score = cursor.read_i32_le()?;
        let duration = cursor.read_f32_le()?;

        // Servers send 0 for every index, so number players in arrival order
        let number = ctx.session.next_player;
        ctx.session.next_player += 1;

        ctx.result.add_player(Player {
            name,
            score: Some(score),
            connect_time: Some(duration),
            ..Player::new(number)
        })?;
    }

    Ok(())
}
