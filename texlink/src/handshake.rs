//! Handshake line: the configuration record, serialized and base64-armored.
//!
//! The forwarder prints [`encode_config`] followed by a newline. The TeX side
//! prepends its engine tag and hands the line to the process it spawns, which
//! recovers both with [`decode_handshake`]. The line never contains a newline
//! of its own.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::config::GlobalConfiguration;
use crate::error::{EngineError, Result};
use crate::name::EngineName;

/// TeX output is flushed in blocks of this size in naive-flush mode.
pub const NAIVE_FLUSH_BLOCK: usize = 4096;

/// Padding character for naive-flush mode. Not part of the base64 alphabet,
/// and unlike spaces TeX does not drop it.
pub const NAIVE_FLUSH_PAD: char = '.';

/// Base64 payload for `config`, padded when `config.naive_flush` is set.
pub fn encode_config(config: &GlobalConfiguration) -> Result<String> {
    let json = serde_json::to_vec(config)
        .map_err(|e| EngineError::Config(format!("failed to serialize configuration: {e}")))?;
    let payload = STANDARD.encode(json);
    if config.naive_flush {
        Ok(pad_for_naive_flush(payload))
    } else {
        Ok(payload)
    }
}

/// Full handshake line as received by the spawned process, without newline.
pub fn handshake_line(name: EngineName, config: &GlobalConfiguration) -> Result<String> {
    let payload = encode_config(config)?;
    let mut line = String::with_capacity(payload.len() + 1);
    line.push(name.tag());
    line.push_str(&payload);
    Ok(line)
}

/// Pad with at least one dot so that, once the newline is appended, the line
/// is one byte longer than a multiple of [`NAIVE_FLUSH_BLOCK`]. The reader
/// finds the payload end at the first dot.
pub fn pad_for_naive_flush(mut payload: String) -> String {
    let target = (payload.len() / NAIVE_FLUSH_BLOCK + 1) * NAIVE_FLUSH_BLOCK;
    while payload.len() < target {
        payload.push(NAIVE_FLUSH_PAD);
    }
    payload
}

/// Recover the engine and configuration from a handshake line.
pub fn decode_handshake(line: &str) -> Result<(EngineName, GlobalConfiguration)> {
    let line = line.trim_end().trim_end_matches(NAIVE_FLUSH_PAD);

    let mut chars = line.chars();
    let tag = chars
        .next()
        .ok_or_else(|| EngineError::Handshake("empty handshake line".to_string()))?;
    let name = EngineName::from_tag(tag)
        .ok_or_else(|| EngineError::Handshake(format!("unknown engine tag {tag:?}")))?;

    let json = STANDARD
        .decode(chars.as_str())
        .map_err(|e| EngineError::Handshake(format!("invalid base64: {e}")))?;
    let config = serde_json::from_slice(&json)
        .map_err(|e| EngineError::Handshake(format!("invalid configuration: {e}")))?;

    Ok((name, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicate::{Communicator, CommunicatorAddress};

    fn sample_config() -> GlobalConfiguration {
        GlobalConfiguration::new()
            .with_debug(5)
            .with_communicator(Communicator::new(CommunicatorAddress::LoopbackNetwork {
                port: 40123,
            }))
    }

    #[test]
    fn peer_recovers_debug_level_and_port() {
        let line = handshake_line(EngineName::LuaTex, &sample_config()).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.starts_with('l'));

        let (name, config) = decode_handshake(&line).unwrap();
        assert_eq!(name, EngineName::LuaTex);
        assert_eq!(config.debug, 5);
        let address = config.communicator.as_ref().unwrap().address();
        assert_eq!(address, &CommunicatorAddress::LoopbackNetwork { port: 40123 });
        assert_eq!(config, sample_config());
    }

    #[test]
    fn naive_flush_pads_past_block_boundary() {
        let config = sample_config().with_naive_flush(true);
        let payload = encode_config(&config).unwrap();
        assert_eq!(payload.len() % NAIVE_FLUSH_BLOCK, 0);
        assert!(payload.ends_with(NAIVE_FLUSH_PAD));

        let exact = "A".repeat(NAIVE_FLUSH_BLOCK);
        assert_eq!(pad_for_naive_flush(exact).len(), 2 * NAIVE_FLUSH_BLOCK);
    }

    #[test]
    fn padded_line_decodes() {
        let config = sample_config().with_naive_flush(true);
        let mut line = handshake_line(EngineName::PdfTex, &config).unwrap();
        line.push('\n');
        let (name, decoded) = decode_handshake(&line).unwrap();
        assert_eq!(name, EngineName::PdfTex);
        assert!(decoded.naive_flush);
        assert_eq!(decoded.debug, 5);
    }

    #[test]
    fn rejects_unknown_tag_and_garbage() {
        assert!(matches!(
            decode_handshake("q AAAA"),
            Err(EngineError::Handshake(_))
        ));
        assert!(matches!(
            decode_handshake("p!!!not base64"),
            Err(EngineError::Handshake(_))
        ));
        assert!(matches!(decode_handshake(""), Err(EngineError::Handshake(_))));
    }
}
