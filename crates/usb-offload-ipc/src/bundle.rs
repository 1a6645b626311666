//! Control-plane blobs staged through the shared region.
//!
//! The descriptor bundle and the ring snapshot do not fit in a single frame, so the host places
//! them in staging slots and sends only a [`crate::protocol::RegionRef`]. Both encodings are
//! little-endian and start with a magic word so a stale or misplaced blob is detected instead of
//! being interpreted.

use crate::protocol::{DecodeError, Reader};

/// `b"UOFB"` as a little-endian `u32`.
pub const BUNDLE_MAGIC: u32 = 0x4246_4F55;

/// `b"UOFS"` as a little-endian `u32`.
pub const SNAPSHOT_MAGIC: u32 = 0x5346_4F55;

const RING_CURSOR_BYTES: usize = 1 + 8 + 1;

/// Dequeue position of one endpoint's transfer ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    /// Endpoint address; bit 7 set for IN.
    pub endpoint: u8,
    /// Bus address of the next TRB to execute.
    pub dequeue: u64,
    /// Consumer cycle state.
    pub cycle: bool,
}

/// Everything the coprocessor needs to resume executing the peripheral's rings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorBundle {
    pub slot_id: u8,
    pub speed: u8,
    pub dcbaa: u64,
    pub device_context: u64,
    pub event_ring: u64,
    pub rings: Vec<RingCursor>,
}

/// Final ring positions reported by the coprocessor when it hands the rings back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RingSnapshot {
    pub rings: Vec<RingCursor>,
}

impl DescriptorBundle {
    pub fn encoded_len(&self) -> usize {
        4 + 1 + 1 + 8 * 3 + 1 + self.rings.len() * RING_CURSOR_BYTES
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&BUNDLE_MAGIC.to_le_bytes());
        out.push(self.slot_id);
        out.push(self.speed);
        out.extend_from_slice(&self.dcbaa.to_le_bytes());
        out.extend_from_slice(&self.device_context.to_le_bytes());
        out.extend_from_slice(&self.event_ring.to_le_bytes());
        encode_rings(&self.rings, &mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        expect_magic(&mut r, BUNDLE_MAGIC)?;
        let slot_id = r.read_u8()?;
        let speed = r.read_u8()?;
        let dcbaa = r.read_u64()?;
        let device_context = r.read_u64()?;
        let event_ring = r.read_u64()?;
        let rings = decode_rings(&mut r)?;
        Ok(Self {
            slot_id,
            speed,
            dcbaa,
            device_context,
            event_ring,
            rings,
        })
    }
}

impl RingSnapshot {
    /// Space to reserve for a snapshot covering `endpoints` rings.
    pub fn max_encoded_len(endpoints: usize) -> usize {
        4 + 1 + endpoints * RING_CURSOR_BYTES
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::max_encoded_len(self.rings.len()));
        out.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        encode_rings(&self.rings, &mut out);
        out
    }

    /// Decodes a snapshot from the front of `bytes`.
    ///
    /// The reserved staging area is usually larger than the snapshot, so trailing bytes are
    /// ignored here.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        expect_magic(&mut r, SNAPSHOT_MAGIC)?;
        Ok(Self {
            rings: decode_rings(&mut r)?,
        })
    }

    pub fn cursor(&self, endpoint: u8) -> Option<&RingCursor> {
        self.rings.iter().find(|c| c.endpoint == endpoint)
    }
}

fn expect_magic(r: &mut Reader<'_>, magic: u32) -> Result<(), DecodeError> {
    let got = r.read_u32()?;
    if got != magic {
        return Err(DecodeError::BadMagic(got));
    }
    Ok(())
}

fn encode_rings(rings: &[RingCursor], out: &mut Vec<u8>) {
    debug_assert!(rings.len() <= u8::MAX as usize);
    out.push(rings.len() as u8);
    for ring in rings {
        out.push(ring.endpoint);
        out.extend_from_slice(&ring.dequeue.to_le_bytes());
        out.push(u8::from(ring.cycle));
    }
}

fn decode_rings(r: &mut Reader<'_>) -> Result<Vec<RingCursor>, DecodeError> {
    let count = usize::from(r.read_u8()?);
    let mut rings = Vec::with_capacity(count);
    for _ in 0..count {
        let endpoint = r.read_u8()?;
        let dequeue = r.read_u64()?;
        let cycle = match r.read_u8()? {
            0 => false,
            1 => true,
            other => return Err(DecodeError::InvalidEnum(other)),
        };
        rings.push(RingCursor {
            endpoint,
            dequeue,
            cycle,
        });
    }
    Ok(rings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_bundle() -> DescriptorBundle {
        DescriptorBundle {
            slot_id: 3,
            speed: 2,
            dcbaa: 0x8000_0000,
            device_context: 0x8000_1000,
            event_ring: 0x8000_2000,
            rings: vec![
                RingCursor {
                    endpoint: 0x00,
                    dequeue: 0x8000_3000,
                    cycle: true,
                },
                RingCursor {
                    endpoint: 0x83,
                    dequeue: 0x8000_4040,
                    cycle: false,
                },
            ],
        }
    }

    #[test]
    fn bundle_length_matches_encoding() {
        let bundle = audio_bundle();
        let bytes = bundle.encode();
        assert_eq!(bytes.len(), bundle.encoded_len());
        assert_eq!(DescriptorBundle::decode(&bytes).unwrap(), bundle);
    }

    #[test]
    fn snapshot_ignores_slack_after_payload() {
        let snapshot = RingSnapshot {
            rings: audio_bundle().rings,
        };
        let mut area = vec![0u8; 1024];
        let bytes = snapshot.encode();
        assert!(bytes.len() <= RingSnapshot::max_encoded_len(2));
        area[..bytes.len()].copy_from_slice(&bytes);
        let decoded = RingSnapshot::decode(&area).unwrap();
        assert_eq!(decoded.cursor(0x83).unwrap().dequeue, 0x8000_4040);
    }

    #[test]
    fn zeroed_area_is_not_a_snapshot() {
        assert_eq!(
            RingSnapshot::decode(&[0u8; 64]),
            Err(DecodeError::BadMagic(0))
        );
    }

    #[test]
    fn bundle_magic_is_not_a_snapshot() {
        let bytes = audio_bundle().encode();
        assert_eq!(
            RingSnapshot::decode(&bytes),
            Err(DecodeError::BadMagic(BUNDLE_MAGIC))
        );
    }
}
