//! Built-in codecs and the registry the engine resolves them from

pub mod a2s;
pub mod gamespy;
pub mod gs4;
pub mod quake3;

use crate::codec::ProtocolCodec;

static CODECS: [&dyn ProtocolCodec; 4] = [
    &a2s::A2s,
    &gamespy::GameSpy,
    &quake3::Quake3,
    &gs4::GameSpy4,
];

/// Every registered codec, in registration order.
pub fn all() -> &'static [&'static dyn ProtocolCodec] {
    &CODECS
}

/// Resolves a protocol identifier such as `a2s` or `q3`.
pub fn lookup(id: &str) -> Option<&'static dyn ProtocolCodec> {
    CODECS.iter().copied().find(|codec| codec.id() == id)
}
