//! Output encoding normalization.
//!
//! Process output leaves the gateway as UTF-8 text. Pseudo-terminals already
//! hand us a UTF-8 stream, but pipe-backed children on hosts whose console
//! code page is not UTF-8 (Windows `cmd` on a Traditional/Simplified Chinese
//! install, typically) emit legacy bytes. The normalizer tries an ordered list
//! of legacy code pages for those and degrades to lossy UTF-8 otherwise. It
//! never fails and never drops output.

use encoding_rs::{Decoder, Encoding, BIG5, GBK, UTF_8};

/// Which decoding strategy applies to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformHint {
    /// Pseudo-terminal output: always the canonical encoding.
    Pty,
    /// Pipe output from a host whose native encoding is UTF-8.
    PipeUtf8,
    /// Pipe output from a host with a legacy console code page.
    PipeLegacy,
}

impl PlatformHint {
    /// The pipe hint for the platform this binary was built for.
    pub fn native_pipe() -> Self {
        if cfg!(windows) {
            PlatformHint::PipeLegacy
        } else {
            PlatformHint::PipeUtf8
        }
    }
}

/// Legacy code pages tried in order: cp950 (Big5) first, then GBK.
pub fn legacy_code_pages() -> [&'static Encoding; 2] {
    [BIG5, GBK]
}

/// Decode one complete chunk of process output.
pub fn decode(bytes: &[u8], hint: PlatformHint) -> String {
    match hint {
        PlatformHint::Pty | PlatformHint::PipeUtf8 => String::from_utf8_lossy(bytes).into_owned(),
        PlatformHint::PipeLegacy => decode_legacy(bytes, &legacy_code_pages()),
    }
}

/// Try each code page strictly; fall back to lossy UTF-8 when none fits.
///
/// A chunk that is already well-formed UTF-8 is taken as is: a console
/// switched to code page 65001 emits UTF-8 that Big5 would also accept.
pub fn decode_legacy(bytes: &[u8], code_pages: &[&'static Encoding]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    for encoding in code_pages {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            return text.into_owned();
        }
        tracing::trace!(encoding = encoding.name(), "chunk is not valid in code page");
    }
    String::from_utf8_lossy(bytes).into_owned()
}

/// Incremental decoder for one output stream.
///
/// Reads from a pipe or PTY split multi-byte sequences at arbitrary points.
/// The UTF-8 paths carry an incomplete trailing sequence over to the next
/// chunk instead of emitting replacement characters for both halves.
pub struct StreamDecoder {
    hint: PlatformHint,
    utf8: Option<Decoder>,
}

impl StreamDecoder {
    pub fn new(hint: PlatformHint) -> Self {
        let utf8 = match hint {
            PlatformHint::Pty | PlatformHint::PipeUtf8 => Some(UTF_8.new_decoder_without_bom_handling()),
            PlatformHint::PipeLegacy => None,
        };
        Self { hint, utf8 }
    }

    /// Decode the next chunk. May return an empty string when the chunk only
    /// contained the start of a multi-byte sequence.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        match self.utf8.as_mut() {
            Some(decoder) => decode_streaming(decoder, bytes, false),
            None => decode(bytes, self.hint),
        }
    }

    /// Flush whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> String {
        match self.utf8.as_mut() {
            Some(decoder) => decode_streaming(decoder, &[], true),
            None => String::new(),
        }
    }
}

fn decode_streaming(decoder: &mut Decoder, bytes: &[u8], last: bool) -> String {
    let capacity = decoder
        .max_utf8_buffer_length(bytes.len())
        .unwrap_or(bytes.len().saturating_mul(3) + 4);
    let mut out = String::with_capacity(capacity);
    let (_result, _read, _had_errors) = decoder.decode_to_string(bytes, &mut out, last);
    out
}
