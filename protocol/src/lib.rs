//! # Game Server Query Protocols
//!
//! This library holds everything needed to talk to a game server without
//! doing any I/O: the result model every protocol fills in, the bounds-checked
//! reader all decoders go through, reassembly of replies split across several
//! datagrams, and the codecs themselves.
//!
//! ## Core Concepts
//!
//! ### Phases
//! A query is a short exchange of request/response pairs. Each pair is a
//! [`Phase`]: an optional challenge handshake, the status request, and
//! separate rules and players requests for protocols that need them. A codec
//! describes through its [`Capabilities`] which phases a challenge gates and
//! which ones the status reply already answers.
//!
//! ### Outcomes
//! Parsing a payload always ends in a [`QueryOutcome`]. Codecs use `?` on
//! [`CodecError`] internally; the error is converted into an outcome at the
//! codec boundary so nothing unwinds into the caller.
//!
//! ### Fragments
//! Replies that do not fit in one datagram are tagged with a series id and a
//! fragment position. Codecs hand those to the [`FragmentReassembler`] through
//! their [`ParseContext`]; completed payloads are queued, never parsed
//! recursively.
//!
//! ## Module Organization
//!
//! ### Wire Module (`wire`)
//! Cursor over a received buffer. Every read is checked against the remaining
//! length and reports truncation as an error.
//!
//! ### Model Module (`model`)
//! Server, rule and player records with the mutation API codecs use
//! (`add_rule`, `get_or_create_player`, `add_info`) and bounded sizes.
//!
//! ### Codec Module (`codec`)
//! The [`ProtocolCodec`] trait plus the per-target state it works on.
//!
//! ### Codecs Module (`codecs`)
//! Built-in protocols and the registry keyed by protocol id:
//! - `a2s`: Source and GoldSrc engines, challenge-gated with split replies
//! - `gamespy`: GameSpy v1 key/value status over numbered datagrams
//! - `q3`: Quake 3 `getstatus`
//! - `gs4`: GameSpy v4 as used by Minecraft
//!
//! ## Usage Example
//!
//! ```rust
//! use protocol::codecs;
//! use protocol::{FragmentReassembler, ParseContext, Phase, PhaseSet, QueryOutcome};
//! use protocol::{RequestParams, ServerResult, SessionState};
//!
//! let codec = codecs::lookup("a2s").unwrap();
//! let params = RequestParams::default();
//! let mut session = SessionState::default();
//! let request = codec.build_request(Phase::Status, &params, &session).unwrap();
//! assert_eq!(&request[..5], &[0xFF, 0xFF, 0xFF, 0xFF, 0x54]);
//!
//! let reply = b"\xFF\xFF\xFF\xFFI\x00MyServer\x00de_dust\x00\x0a\x10\x01d\x00";
//! let mut result = ServerResult::new();
//! let mut fragments = FragmentReassembler::new();
//! let mut completed = Vec::new();
//! let mut ctx = ParseContext::new(
//!     &mut result,
//!     &mut session,
//!     &params,
//!     &mut fragments,
//!     &mut completed,
//!     Some(Phase::Status),
//!     PhaseSet::EMPTY,
//! );
//!
//! assert_eq!(codec.parse_response(reply, &mut ctx), QueryOutcome::DoneForce);
//! assert_eq!(result.name.as_deref(), Some("MyServer"));
//! ```

pub mod codec;
pub mod codecs;
pub mod model;
pub mod outcome;
pub mod reassembly;
pub mod wire;

pub use codec::{
    Capabilities, ParseContext, Phase, PhaseSet, ProtocolCodec, RequestParams, SessionState,
};
pub use model::{DedupPolicy, Player, PlayerInfo, Rule, RuleInsert, ServerResult};
pub use outcome::{CodecError, QueryErrorKind, QueryOutcome};
pub use reassembly::FragmentReassembler;
pub use wire::{WireCursor, WireError};
