//! Deterministic fixtures and fake collaborators.
//!
//! Everything here is seeded: two runs with the same seed produce
//! byte-identical frames, shards, and galleries, which is what the
//! bit-stable artifact contract is tested against.
//!
//! The fakes mirror the collaborator seams the engine expects: a detector
//! that proposes one full-frame box, a tracker that hands out stable track
//! ids, and an embedder that decodes the embedding planted in the frame
//! payload by [`FrameScript`].

use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

use sightline_core::similarity::normalize;
use sightline_core::types::BBox;
use sightline_pipeline::engine::{
    Detector, Embedder, EmbedderError, Frame, TrackedBox, Tracker,
};

/// Deterministic unit vector from a seeded stream.
pub fn seeded_unit_vec(rng: &mut ChaCha8Rng, dim: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    normalize(&mut v);
    v
}

/// A unit vector near `base`: `base + noise`, renormalized.
pub fn jittered_unit_vec(rng: &mut ChaCha8Rng, base: &[f32], noise: f32) -> Vec<f32> {
    let mut v: Vec<f32> = base
        .iter()
        .map(|&x| x + rng.gen_range(-noise..noise))
        .collect();
    normalize(&mut v);
    v
}

/// Unit vector along a single axis.
pub fn axis_unit_vec(dim: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    v[axis % dim] = 1.0;
    v
}

/// Encode an embedding into a frame payload (little-endian f32s).
pub fn encode_payload(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Decode a frame payload back into an embedding.
pub fn decode_payload(data: &[u8]) -> Result<Vec<f32>, EmbedderError> {
    if data.len() % 4 != 0 {
        return Err(EmbedderError(format!(
            "payload length {} is not a multiple of 4",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Scripted frame source: embeddings planted per frame, decoded later by
/// [`PayloadEmbedder`].
#[derive(Debug, Default)]
pub struct FrameScript {
    frames: Vec<Frame>,
}

impl FrameScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame carrying `embedding`.
    pub fn push(&mut self, embedding: &[f32]) -> &mut Self {
        let seq = self.frames.len() as u64;
        self.frames.push(Frame {
            seq,
            data: encode_payload(embedding),
            bbox_hint: None,
            timestamp_ms: Some(seq as i64 * 33),
        });
        self
    }

    /// Append `count` jittered copies of `base`.
    pub fn push_cluster(&mut self, rng: &mut ChaCha8Rng, base: &[f32], noise: f32, count: usize) {
        for _ in 0..count {
            let v = jittered_unit_vec(rng, base, noise);
            self.push(&v);
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn into_frames(self) -> impl Iterator<Item = Frame> {
        self.frames.into_iter()
    }
}

/// Detector fake: one box covering the synthetic frame.
#[derive(Debug, Default)]
pub struct FakeDetector;

impl Detector for FakeDetector {
    fn detect(&mut self, frame: &Frame) -> Vec<BBox> {
        match frame.bbox_hint {
            Some(hint) => vec![hint],
            None => vec![BBox([0, 0, 64, 64])],
        }
    }
}

/// Tracker fake: stable incremental track ids, boxes passed through.
#[derive(Debug, Default)]
pub struct PassThroughTracker {
    next_id: u64,
}

impl Tracker for PassThroughTracker {
    fn update(&mut self, detections: Vec<BBox>) -> Vec<TrackedBox> {
        detections
            .into_iter()
            .map(|bbox| {
                let track_id = self.next_id;
                self.next_id += 1;
                TrackedBox { track_id, bbox }
            })
            .collect()
    }
}

/// Embedder fake: decodes the embedding planted in the payload.
#[derive(Debug, Default)]
pub struct PayloadEmbedder;

impl Embedder for PayloadEmbedder {
    fn embed(&mut self, frame: &Frame, _bbox: Option<&BBox>) -> Result<Vec<f32>, EmbedderError> {
        decode_payload(&frame.data)
    }
}

/// Embedder fake that fails every `every`-th call.
#[derive(Debug)]
pub struct FlakyEmbedder {
    inner: PayloadEmbedder,
    every: u64,
    calls: u64,
}

impl FlakyEmbedder {
    pub fn new(every: u64) -> Self {
        Self {
            inner: PayloadEmbedder,
            every: every.max(1),
            calls: 0,
        }
    }
}

impl Embedder for FlakyEmbedder {
    fn embed(&mut self, frame: &Frame, bbox: Option<&BBox>) -> Result<Vec<f32>, EmbedderError> {
        self.calls += 1;
        if self.calls % self.every == 0 {
            return Err(EmbedderError("synthetic failure".to_string()));
        }
        self.inner.embed(frame, bbox)
    }
}

/// Write a gallery manifest (JSONL of `{label, embedding}`) for tests.
pub fn write_gallery_manifest(
    path: &std::path::Path,
    entries: &[(&str, Vec<f32>)],
) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::File::create(path)?;
    for (label, embedding) in entries {
        let line = serde_json::json!({ "label": label, "embedding": embedding });
        writeln!(file, "{line}")?;
    }
    Ok(())
}

/// Write a kb.json exemplar store (`[{label, embedding}, ...]`).
pub fn write_kb_json(
    path: &std::path::Path,
    entries: &[(&str, Vec<f32>)],
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let items: Vec<serde_json::Value> = entries
        .iter()
        .map(|(label, embedding)| serde_json::json!({ "label": label, "embedding": embedding }))
        .collect();
    std::fs::write(path, serde_json::to_string_pretty(&items)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let v = seeded_unit_vec(&mut rng, 32);
        let decoded = decode_payload(&encode_payload(&v)).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn seeded_vectors_are_reproducible() {
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(seeded_unit_vec(&mut a, 16), seeded_unit_vec(&mut b, 16));
    }

    #[test]
    fn flaky_embedder_fails_on_schedule() {
        let mut script = FrameScript::new();
        script.push(&axis_unit_vec(8, 0));
        let frames: Vec<Frame> = script.into_frames().collect();

        let mut embedder = FlakyEmbedder::new(2);
        assert!(embedder.embed(&frames[0], None).is_ok());
        assert!(embedder.embed(&frames[0], None).is_err());
        assert!(embedder.embed(&frames[0], None).is_ok());
    }
}
