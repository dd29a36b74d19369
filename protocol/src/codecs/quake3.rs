//! Quake 3 `getstatus` query
//!
//! One request, one reply: the server info string on the first line and one
//! `<score> <ping> "<name>"` line per player after it.

use crate::codec::{Capabilities, ParseContext, Phase, PhaseSet, ProtocolCodec, RequestParams, SessionState};
use crate::model::Player;
use crate::outcome::{CodecError, QueryOutcome};
use crate::wire::WireCursor;

const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const STATUS_REQUEST: &[u8] = b"getstatus";
const STATUS_RESPONSE: &[u8] = b"statusResponse";

#[derive(Debug, Default, Clone, Copy)]
pub struct Quake3;

impl ProtocolCodec for Quake3 {
    fn id(&self) -> &'static str {
        "q3"
    }

    fn description(&self) -> &'static str {
        "Quake 3 status query"
    }

    fn default_port(&self) -> u16 {
        27960
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
            Phase::Status => Ok([&HEADER[..], STATUS_REQUEST].concat()),
            other => Err(CodecError::Protocol(format!(
                "q3 has no separate {} request",
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
    cursor.expect(&HEADER)?;
    if cursor.expect(STATUS_RESPONSE).is_err() {
        return Err(CodecError::Protocol("not a statusResponse".into()));
    }
    ctx.accept(Phase::Status)?;

    let body = String::from_utf8_lossy(cursor.read_rest());
    let mut lines = body.split('\n').skip(1);
    let info = lines
        .next()
        .ok_or_else(|| CodecError::Malformed("missing info string".into()))?;

    parse_info(info, ctx)?;

    let mut count = 0;
    for line in lines.filter(|l| !l.trim().is_empty()) {
        parse_player_line(line, ctx)?;
        count += 1;
    }
    ctx.result.num_players = count;

    ctx.answer(Phase::Status);
    ctx.answer(Phase::Rules);
    ctx.answer(Phase::Players);
    Ok(QueryOutcome::DoneForce)
}

fn parse_info(info: &str, ctx: &mut ParseContext<'_>) -> Result<(), CodecError> {
    let mut fields = info.strip_prefix('\\').unwrap_or(info).split('\\');

    while let Some(key) = fields.next() {
        if key.is_empty() {
            continue;
        }
        let value = fields
            .next()
            .ok_or_else(|| CodecError::Malformed(format!("info key {} has no value", key)))?;

        match key {
            "sv_hostname" => ctx.result.name = Some(value.into()),
            "mapname" => ctx.result.map = Some(value.into()),
            "gamename" => ctx.result.game = Some(value.into()),
            "sv_maxclients" => {
                ctx.result.max_players = value.trim().parse().map_err(|_| {
                    CodecError::Malformed(format!("sv_maxclients is not a number: {:?}", value))
                })?
            }
            _ => {}
        }
        ctx.add_rule(key, value)?;
    }

    Ok(())
}

fn parse_player_line(line: &str, ctx: &mut ParseContext<'_>) -> Result<(), CodecError> {
    let malformed = || CodecError::Malformed(format!("bad player line {:?}", line));

    let (numbers, quoted) = line.split_once('"').ok_or_else(malformed)?;
    let name = quoted.rsplit_once('"').map(|(name, _)| name).ok_or_else(malformed)?;

    let mut numbers = numbers.split_whitespace();
    let score = numbers.next().and_then(|s| s.parse::<i32>().ok()).ok_or_else(malformed)?;
    let ping = numbers.next().and_then(|s| s.parse::<u32>().ok()).ok_or_else(malformed)?;

    let number = ctx.session.next_player;
    ctx.session.next_player += 1;

    ctx.result.add_player(Player {
        name: name.into(),
        score: Some(score),
        ping: Some(ping),
        ..Player::new(number)
    })?;
    Ok(())
}
