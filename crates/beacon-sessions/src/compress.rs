//! Gzip frame compression. Compressed frames travel as
//! `{"compressed": true, "compression_ratio": r, "data": <hex gzip>}` and
//! are only adopted when the ratio beats [`WORTHWHILE_RATIO`].

use beacon_types::{BeaconError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::io::{Read, Write};

/// Compression must shave at least 20% off or the plain frame is kept.
pub const WORTHWHILE_RATIO: f64 = 0.8;

/// Compress a frame when it is at least `threshold` bytes and compression
/// actually pays off. Returns the frame to put on the wire plus whether it
/// was compressed.
pub fn maybe_compress(frame: &Value, threshold: usize) -> Result<(Value, bool, Option<f64>)> {
    let plain = serde_json::to_string(frame)?;
    if plain.len() < threshold {
        return Ok((frame.clone(), false, None));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(plain.as_bytes())
        .map_err(|e| BeaconError::transient_delivery(format!("gzip failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| BeaconError::transient_delivery(format!("gzip failed: {e}")))?;

    let ratio = compressed.len() as f64 / plain.len() as f64;
    if ratio < WORTHWHILE_RATIO {
        let envelope = json!({
            "compressed": true,
            "compression_ratio": ratio,
            "original_size": plain.len(),
            "compressed_size": compressed.len(),
            "data": hex::encode(compressed),
        });
        Ok((envelope, true, Some(ratio)))
    } else {
        Ok((frame.clone(), false, None))
    }
}

/// Inverse of [`maybe_compress`]. Frames without the `compressed` flag pass
/// through untouched.
pub fn decompress(frame: &Value) -> Result<Value> {
    if frame.get("compressed").and_then(Value::as_bool) != Some(true) {
        return Ok(frame.clone());
    }

    let data = frame
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| BeaconError::validation("compressed frame missing data"))?;
    let compressed =
        hex::decode(data).map_err(|e| BeaconError::validation(format!("bad hex payload: {e}")))?;

    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut plain = String::new();
    decoder
        .read_to_string(&mut plain)
        .map_err(|e| BeaconError::validation(format!("gunzip failed: {e}")))?;
    Ok(serde_json::from_str(&plain)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repetitive_frame() -> Value {
        json!({
            "type": "batched_events",
            "events": vec![json!({"type": "health_update", "data": {"status": "healthy"}}); 50],
        })
    }

    #[test]
    fn small_frames_stay_plain() {
        let frame = json!({"type": "pong"});
        let (wire, compressed, ratio) = maybe_compress(&frame, 1024).unwrap();
        assert!(!compressed);
        assert!(ratio.is_none());
        assert_eq!(wire, frame);
    }

    #[test]
    fn repetitive_frames_compress_and_round_trip() {
        let frame = repetitive_frame();
        let (wire, compressed, ratio) = maybe_compress(&frame, 64).unwrap();
        assert!(compressed);
        assert!(ratio.unwrap() < WORTHWHILE_RATIO);
        assert_eq!(wire["compressed"], true);
        assert!(wire["data"].is_string());

        let restored = decompress(&wire).unwrap();
        assert_eq!(restored, frame);
    }

    #[test]
    fn decompress_passes_plain_frames_through() {
        let frame = json!({"type": "pong", "compressed": false});
        assert_eq!(decompress(&frame).unwrap(), frame);
    }

    #[test]
    fn decompress_rejects_garbage() {
        let bad_hex = json!({"compressed": true, "data": "zzzz"});
        assert!(decompress(&bad_hex).is_err());

        let missing = json!({"compressed": true});
        assert!(decompress(&missing).is_err());
    }
}
