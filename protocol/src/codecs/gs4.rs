//! GameSpy v4 query, as spoken by Minecraft servers
//!
//! Requests start with `FE FD`, a type byte and the client's session id.
//! The server only answers a full-stat request that echoes the token it
//! handed out in the handshake, so the status phase is challenge-gated.
//!
//! The full-stat reply holds a padded `splitnum` header, NUL-separated
//! key/value pairs ended by an empty key, then a `\x01player_\0\0` marker
//! followed by NUL-terminated player names ended by an empty name.

use crate::codec::{Capabilities, ParseContext, Phase, PhaseSet, ProtocolCodec, RequestParams, SessionState};
use crate::model::Player;
use crate::outcome::{CodecError, QueryOutcome};
use crate::wire::WireCursor;
use log::debug;

const MAGIC: [u8; 2] = [0xFE, 0xFD];
const TYPE_HANDSHAKE: u8 = 0x09;
const TYPE_STAT: u8 = 0x00;

/// Session ids must survive the server masking each byte with `0x0F`.
pub const SESSION_MASK: u32 = 0x0F0F_0F0F;

const SPLITNUM_PADDING: &[u8] = b"splitnum\0\x80\0";
const PLAYER_MARKER: &[u8] = b"\x01player_\0\0";

#[derive(Debug, Default, Clone, Copy)]
pub struct GameSpy4;

impl ProtocolCodec for GameSpy4 {
    fn id(&self) -> &'static str {
        "gs4"
    }

    fn description(&self) -> &'static str {
        "GameSpy v4 / Minecraft query"
    }

    fn default_port(&self) -> u16 {
        25565
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            challenge_gates: PhaseSet::EMPTY.with(Phase::Status),
            status_includes: PhaseSet::of(&[Phase::Rules, Phase::Players]),
        }
    }

    fn init_session(&self, session: &mut SessionState) {
        session.session_id = rand::random::<u32>() & SESSION_MASK;
    }

    fn build_request(
        &self,
        phase: Phase,
        _params: &RequestParams,
        session: &SessionState,
    ) -> Result<Vec<u8>, CodecError> {
        let session_id = session.session_id.to_be_bytes();

        match phase {
            Phase::Challenge => Ok([&MAGIC[..], &[TYPE_HANDSHAKE], &session_id].concat()),
            Phase::Status => {
                let token = session
                    .challenge
                    .ok_or_else(|| CodecError::Protocol("full stat needs a challenge token".into()))?;
                Ok([
                    &MAGIC[..],
                    &[TYPE_STAT],
                    &session_id,
                    &token.to_be_bytes(),
                    &[0, 0, 0, 0],
                ]
                .concat())
            }
            other => Err(CodecError::Protocol(format!(
                "gs4 has no separate {} request",
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
    let mut cursor = WireCursor::new(raw);
    let kind = cursor.read_u8()?;
    let session_id = cursor.read_i32_be()? as u32;

    if session_id != ctx.session.session_id {
        return Err(CodecError::Protocol(format!(
            "session id {:#010x} does not match {:#010x}",
            session_id, ctx.session.session_id
        )));
    }

    match kind {
        TYPE_HANDSHAKE => parse_handshake(&mut cursor, ctx),
        TYPE_STAT => {
            ctx.accept(Phase::Status)?;
            parse_full_stat(&mut cursor, ctx)?;
            ctx.answer(Phase::Status);
            ctx.answer(Phase::Rules);
            ctx.answer(Phase::Players);
            Ok(QueryOutcome::DoneForce)
        }
        other => Err(CodecError::UnknownType(other)),
    }
}

fn parse_handshake(cursor: &mut WireCursor<'_>, ctx: &mut ParseContext<'_>) -> Result<QueryOutcome, CodecError> {
    let text = cursor.read_cstring()?;
    let token = text
        .trim()
        .parse::<i32>()
        .map_err(|_| CodecError::Malformed(format!("challenge token {:?} is not a number", text)))?;

    if ctx.current() == Some(Phase::Challenge) {
        ctx.accept(Phase::Challenge)?;
        ctx.session.challenge = Some(token);
        ctx.answer(Phase::Challenge);
        return Ok(QueryOutcome::DoneForce);
    }

    if ctx.session.challenge == Some(token) {
        return Err(CodecError::Unexpected(Phase::Challenge.name()));
    }
    ctx.session.challenge = Some(token);

    debug!("Fresh gs4 token {} received, re-sending", token);
    ctx.request_resend();
    Ok(QueryOutcome::InProgress)
}

fn parse_number(key: &str, value: &str) -> Result<u32, CodecError> {
    value
        .trim()
        .parse()
        .map_err(|_| CodecError::Malformed(format!("{} is not a number: {:?}", key, value)))
}

fn parse_full_stat(cursor: &mut WireCursor<'_>, ctx: &mut ParseContext<'_>) -> Result<(), CodecError> {
    cursor.expect(SPLITNUM_PADDING)?;

    loop {
        let key = cursor.read_cstring()?;
        if key.is_empty() {
            break;
        }
        let value = cursor.read_cstring()?;

        match key.as_str() {
            "hostname" => ctx.result.name = Some(value),
            "map" => ctx.result.map = Some(value),
            "game_id" => ctx.result.game = Some(value),
            "numplayers" => ctx.result.num_players = parse_number(&key, &value)?,
            "maxplayers" => ctx.result.max_players = parse_number(&key, &value)?,
            _ => {
                ctx.add_rule(&key, &value)?;
            }
        }
    }

    cursor.expect(PLAYER_MARKER)?;

    loop {
        let name = cursor.read_cstring()?;
        if name.is_empty() {
            break;
        }
        let number = ctx.session.next_player;
        ctx.session.next_player += 1;
        ctx.result.add_player(Player {
            name,
            ..Player::new(number)
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::harness::Harness;
    use crate::outcome::QueryErrorKind;

    const SESSION: u32 = 0x0102_0304;

    fn harness(current: Phase) -> Harness {
        let mut h = Harness::new(Some(current));
        h.session.session_id = SESSION;
        h
    }

    fn full_stat() -> Vec<u8> {
        [
            &[TYPE_STAT][..],
            &SESSION.to_be_bytes(),
            SPLITNUM_PADDING,
            b"hostname\0A Minecraft Server\0",
            b"gametype\0SMP\0",
            b"game_id\0MINECRAFT\0",
            b"version\01.20.1\0",
            b"map\0world\0",
            b"numplayers\02\0",
            b"maxplayers\020\0",
            b"\0",
            PLAYER_MARKER,
            b"Steve\0Alex\0\0",
        ]
        .concat()
    }

    #[test]
    fn test_session_id_is_masked() {
        let mut session = SessionState::default();
        for _ in 0..32 {
            GameSpy4.init_session(&mut session);
            assert_eq!(session.session_id & !SESSION_MASK, 0);
        }
    }

    #[test]
    fn test_handshake_then_full_stat_request() {
        let mut h = harness(Phase::Challenge);
        let reply = [&[TYPE_HANDSHAKE][..], &SESSION.to_be_bytes(), b"9513307\0"].concat();

        assert_eq!(h.parse(&GameSpy4, &reply), QueryOutcome::DoneForce);
        assert_eq!(h.session.challenge, Some(9513307));

        let request = GameSpy4
            .build_request(Phase::Status, &RequestParams::default(), &h.session)
            .unwrap();
        assert_eq!(&request[..3], &[0xFE, 0xFD, 0x00]);
        assert_eq!(&request[3..7], &SESSION.to_be_bytes());
        assert_eq!(&request[7..11], &9513307i32.to_be_bytes());
        assert_eq!(&request[11..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_status_without_token_fails() {
        let err = GameSpy4
            .build_request(Phase::Status, &RequestParams::default(), &SessionState::default())
            .unwrap_err();
        assert!(matches!(err, CodecError::Protocol(_)));
    }

    #[test]
    fn test_full_stat() {
        let mut h = harness(Phase::Status);
        assert_eq!(h.parse(&GameSpy4, &full_stat()), QueryOutcome::DoneForce);

        assert_eq!(h.result.name.as_deref(), Some("A Minecraft Server"));
        assert_eq!(h.result.map.as_deref(), Some("world"));
        assert_eq!(h.result.game.as_deref(), Some("MINECRAFT"));
        assert_eq!(h.result.num_players, 2);
        assert_eq!(h.result.max_players, 20);
        assert_eq!(h.result.rule("version"), Some("1.20.1"));

        let names: Vec<&str> = h.result.players().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Steve", "Alex"]);
    }

    #[test]
    fn test_full_stat_prefixes_never_succeed() {
        let full = full_stat();
        for len in 0..full.len() {
            let mut h = harness(Phase::Status);
            let outcome = h.parse(&GameSpy4, &full[..len]);
            assert_eq!(
                outcome,
                QueryOutcome::Error(QueryErrorKind::MalformedPacket),
                "prefix of {} bytes",
                len
            );
        }
    }

    #[test]
    fn test_expired_token_triggers_resend() {
        let mut h = harness(Phase::Status);
        let reply = [&[TYPE_HANDSHAKE][..], &SESSION.to_be_bytes(), b"42\0"].concat();

        assert_eq!(h.parse(&GameSpy4, &reply), QueryOutcome::InProgress);
        assert!(h.resend);
        assert_eq!(h.session.challenge, Some(42));
    }

    #[test]
    fn test_duplicate_handshake_is_ignored() {
        let mut h = harness(Phase::Status);
        h.session.challenge = Some(42);
        h.sealed = PhaseSet::EMPTY.with(Phase::Challenge);
        let reply = [&[TYPE_HANDSHAKE][..], &SESSION.to_be_bytes(), b"42\0"].concat();

        assert_eq!(
            h.parse(&GameSpy4, &reply),
            QueryOutcome::Error(QueryErrorKind::OrderingError)
        );
        assert!(!h.resend);
    }

    #[test]
    fn test_foreign_session_rejected() {
        let mut h = harness(Phase::Challenge);
        let reply = [&[TYPE_HANDSHAKE][..], &0x0A0B_0C0Du32.to_be_bytes(), b"1\0"].concat();
        assert_eq!(
            h.parse(&GameSpy4, &reply),
            QueryOutcome::Error(QueryErrorKind::ProtocolError)
        );
        assert!(h.session.challenge.is_none());
    }
}
