//! Reed-Solomon forward error correction
//!
//! Outgoing datagrams are grouped `data_shards` at a time. Once a group is
//! complete, `parity_shards` parity datagrams are emitted for it, so the
//! receiver can rebuild up to `parity_shards` lost datagrams per group
//! without waiting for a retransmission.
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+
//! |         Sequence (4B)             |   Flag (2B)     |
//! +--------+--------+--------+--------+--------+--------+
//! | Size (2B, data shards only)  |        Payload       |
//! +--------+--------+--------+--------+--------+--------+
//! ```
//!
//! Shard `i` of group `g` carries sequence `g * (data + parity) + i`.

use super::stats::{self, TransportStats};
use super::TransportError;
use bytes::{BufMut, Bytes};
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// FEC header size in bytes
pub const FEC_HEADER_SIZE: usize = 6;

/// Header plus the size prefix of data shards
pub const FEC_OVERHEAD: usize = FEC_HEADER_SIZE + 2;

const TYPE_DATA: u16 = 0xf1;
const TYPE_PARITY: u16 = 0xf2;

/// Groups kept for reconstruction before the oldest is dropped
const MAX_PENDING_GROUPS: usize = 32;

/// Extract the payload of a data shard (`size` prefix included in `size`)
fn data_shard_payload(shard: &[u8]) -> Option<Bytes> {
    let prefix: [u8; 2] = shard.get(..2)?.try_into().ok()?;
    let size = usize::from(u16::from_be_bytes(prefix));
    if size < 2 || size > shard.len() {
        return None;
    }
    Some(Bytes::copy_from_slice(&shard[2..size]))
}

/// Return the KCP payload of `packet` if it is an FEC data shard
pub fn data_payload(packet: &[u8]) -> Option<&[u8]> {
    let flag: [u8; 2] = packet.get(4..FEC_HEADER_SIZE)?.try_into().ok()?;
    if u16::from_be_bytes(flag) != TYPE_DATA {
        return None;
    }
    packet.get(FEC_OVERHEAD..)
}

fn new_codec(data_shards: usize, parity_shards: usize) -> Result<ReedSolomon, TransportError> {
    ReedSolomon::new(data_shards, parity_shards)
        .map_err(|e| TransportError::Fec(format!("{:?}", e)))
}

/// Sequence numbers wrap at the largest multiple of the group size
fn paws(total: usize) -> u32 {
    (u32::MAX / total as u32) * total as u32
}

/// Sender side of the FEC layer
pub struct FecEncoder {
    codec: ReedSolomon,
    data_shards: usize,
    parity_shards: usize,
    paws: u32,
    next_seq: u32,
    group: Vec<Vec<u8>>,
    stats: Arc<TransportStats>,
}

impl FecEncoder {
    /// Returns `None` when either shard count is zero (FEC disabled)
    pub fn new(
        data_shards: usize,
        parity_shards: usize,
        stats: Arc<TransportStats>,
    ) -> Result<Option<Self>, TransportError> {
        if data_shards == 0 || parity_shards == 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            codec: new_codec(data_shards, parity_shards)?,
            data_shards,
            parity_shards,
            paws: paws(data_shards + parity_shards),
            next_seq: 0,
            group: Vec::with_capacity(data_shards),
            stats,
        }))
    }

    fn header(&mut self, flag: u16, capacity: usize) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(FEC_HEADER_SIZE + capacity);
        pkt.put_u32(self.next_seq);
        pkt.put_u16(flag);
        self.next_seq = (self.next_seq + 1) % self.paws;
        pkt
    }

    /// Wrap one datagram, returning it plus any parity datagrams it completes
    pub fn encode(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let mut packets = Vec::with_capacity(1);

        let mut shard = Vec::with_capacity(2 + payload.len());
        shard.put_u16((payload.len() + 2) as u16);
        shard.extend_from_slice(payload);

        let mut pkt = self.header(TYPE_DATA, shard.len());
        pkt.extend_from_slice(&shard);
        packets.push(pkt);
        self.group.push(shard);

        if self.group.len() < self.data_shards {
            return packets;
        }

        let size = self.group.iter().map(Vec::len).max().unwrap_or(0);
        let mut shards: Vec<Vec<u8>> = self
            .group
            .drain(..)
            .map(|mut s| {
                s.resize(size, 0);
                s
            })
            .collect();
        shards.extend((0..self.parity_shards).map(|_| vec![0u8; size]));

        match self.codec.encode(&mut shards) {
            Ok(()) => {
                for parity in &shards[self.data_shards..] {
                    let mut pkt = self.header(TYPE_PARITY, parity.len());
                    pkt.extend_from_slice(parity);
                    packets.push(pkt);
                }
                stats::add(&self.stats.fec_parity_shards, self.parity_shards as u64);
            }
            Err(e) => {
                trace!("FEC encode failed: {:?}", e);
                stats::add(&self.stats.fec_errs, 1);
                for _ in 0..self.parity_shards {
                    self.next_seq = (self.next_seq + 1) % self.paws;
                }
            }
        }

        packets
    }
}

struct Group {
    shards: Vec<Option<Vec<u8>>>,
    received: usize,
    done: bool,
}

/// Receiver side of the FEC layer
pub struct FecDecoder {
    codec: ReedSolomon,
    data_shards: usize,
    total: usize,
    groups: BTreeMap<u32, Group>,
    stats: Arc<TransportStats>,
}

impl FecDecoder {
    /// Returns `None` when either shard count is zero (FEC disabled)
    pub fn new(
        data_shards: usize,
        parity_shards: usize,
        stats: Arc<TransportStats>,
    ) -> Result<Option<Self>, TransportError> {
        if data_shards == 0 || parity_shards == 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            codec: new_codec(data_shards, parity_shards)?,
            data_shards,
            total: data_shards + parity_shards,
            groups: BTreeMap::new(),
            stats,
        }))
    }

    /// Accept one FEC datagram. Returns the KCP datagrams it makes available:
    /// the datagram itself if it is a data shard, plus anything rebuilt.
    pub fn decode(&mut self, packet: &[u8]) -> Vec<Bytes> {
        let mut ready = Vec::new();

        if packet.len() < FEC_HEADER_SIZE {
            stats::add(&self.stats.fec_errs, 1);
            return ready;
        }
        let seq = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
        let flag = u16::from_be_bytes([packet[4], packet[5]]);
        let body = &packet[FEC_HEADER_SIZE..];

        match flag {
            TYPE_DATA => match data_shard_payload(body) {
                Some(payload) => ready.push(payload),
                None => {
                    stats::add(&self.stats.fec_errs, 1);
                    return ready;
                }
            },
            TYPE_PARITY => {}
            _ => {
                stats::add(&self.stats.fec_errs, 1);
                return ready;
            }
        }

        let group_id = seq / self.total as u32;
        let index = (seq % self.total as u32) as usize;
        let total = self.total;
        let group = self.groups.entry(group_id).or_insert_with(|| Group {
            shards: vec![None; total],
            received: 0,
            done: false,
        });

        if !group.done && group.shards[index].is_none() {
            group.shards[index] = Some(body.to_vec());
            group.received += 1;

            if group.received >= self.data_shards {
                group.done = true;
                let missing: Vec<usize> = (0..self.data_shards)
                    .filter(|&i| group.shards[i].is_none())
                    .collect();
                if !missing.is_empty() {
                    self.recover(group_id, &missing, &mut ready);
                }
            }
        }

        while self.groups.len() > MAX_PENDING_GROUPS {
            self.groups.pop_first();
        }

        ready
    }

    fn recover(&mut self, group_id: u32, missing: &[usize], ready: &mut Vec<Bytes>) {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        let size = group.shards[self.data_shards..]
            .iter()
            .flatten()
            .map(Vec::len)
            .max();
        let Some(size) = size else {
            return;
        };

        for shard in group.shards.iter_mut().flatten() {
            if shard.len() < size {
                shard.resize(size, 0);
            }
        }

        match self.codec.reconstruct_data(&mut group.shards) {
            Ok(()) => {
                for &i in missing {
                    if let Some(payload) = group.shards[i].as_deref().and_then(data_shard_payload) {
                        ready.push(payload);
                        stats::add(&self.stats.fec_recovered, 1);
                    }
                }
            }
            Err(e) => {
                trace!("FEC reconstruction of group {} failed: {:?}", group_id, e);
                stats::add(&self.stats.fec_errs, 1);
            }
        }
    }
}
