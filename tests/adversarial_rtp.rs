//! Adversarial Property-Based Tests for RTP Packet Handling
//!
//! # Attack Plan
//!
//! 1. **Malformed RTP Headers**: Truncated packets, wrong version, invalid CSRC counts
//!    that could cause out-of-bounds reads.
//!
//! 2. **Extension Header Overflow**: Extension length field that exceeds actual packet
//!    size, causing potential buffer over-read.
//!
//! 3. **Bogus Padding**: Padding count of zero or larger than the packet body.
//!
//! 4. **Sequence Number Wraparound**: 65535 -> 0 transition must be handled correctly
//!    for packet ordering.
//!
//! 5. **Memory Exhaustion**: Many packets written into the jitter buffer without
//!    reading.
//!
//! 6. **Jitter Buffer Attacks**: Shuffled delivery, late packet floods,
//!    duplicate packet storms, random arrival times.
//!
//! # Invariants
//!
//! - RtpPacket::decode never panics on any input
//! - RtpPacket::decode rejects non-v2 packets
//! - Jitter buffer never panics on any sequence of operations
//! - Jitter buffer never holds more than `capacity` packets
//! - Buffered duration is never negative
//! - Read order is strictly increasing in extended sequence

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use rtp_playout::rtp::clock::clock_rates;
use rtp_playout::rtp::{
    DecodeError, JitterBuffer, JitterBufferConfig, JitterBufferStats, RtpClock, RtpPacket,
};

// ============================================================================
// ADVERSARIAL GENERATORS
// ============================================================================

/// Generate malformed RTP packets
fn malformed_rtp_packet() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        // Too short
        Just(vec![]),
        Just(vec![0x80]),
        Just(vec![0x80, 0x00]),
        Just(vec![0x80, 0x00, 0x00, 0x01]),
        Just(vec![0x80, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10]),
        Just(vec![0x80, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00]), // 11 bytes
        // Wrong version (0, 1, 3)
        Just(vec![0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        Just(vec![0x40, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        Just(vec![0xC0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        // Max CSRC count (15) but no CSRC data
        Just(vec![0x8F, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        // Extension bit set but no extension data
        Just(vec![0x90, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        // Extension with bogus length (claims 65535 32-bit words)
        Just(vec![
            0x90, 0x00, // V=2, X=1
            0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01,
            0xBE, 0xDE, // Extension header ID
            0xFF, 0xFF, // Extension length = 65535 words = 262140 bytes
        ]),
        // Padding bit set, padding count zero
        Just(vec![0xA0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01, 0xAA, 0x00]),
        // Padding count larger than the body
        Just(vec![0xA0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01, 0xFF]),
        // Padding bit set on a bare header
        Just(vec![0xA0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01]),
        // All zeros
        Just(vec![0x00; 100]),
    ]
}

/// Generate valid RTP packet structure
fn valid_rtp_packet(payload_size: usize) -> impl Strategy<Value = (Vec<u8>, u8, u16, u32, u32)> {
    (0u8..128u8, any::<u16>(), any::<u32>(), any::<u32>()).prop_map(
        move |(pt, seq, ts, ssrc)| {
            let mut packet = vec![0x80, pt]; // V=2, PT
            packet.extend_from_slice(&seq.to_be_bytes());
            packet.extend_from_slice(&ts.to_be_bytes());
            packet.extend_from_slice(&ssrc.to_be_bytes());
            packet.extend(vec![0u8; payload_size]);
            (packet, pt, seq, ts, ssrc)
        },
    )
}

fn make_packet(seq: u16, timestamp: u32) -> RtpPacket {
    RtpPacket::new(0, seq, timestamp, 0x1234, vec![0u8; 160])
}

fn buffer(target_jitter_ms: i64, capacity: usize) -> JitterBuffer {
    JitterBuffer::new(
        JitterBufferConfig {
            target_jitter_ms,
            capacity,
        },
        RtpClock::new(clock_rates::AUDIO_8KHZ),
    )
}

fn drain(buffer: &JitterBuffer) -> Vec<u16> {
    std::iter::from_fn(|| buffer.read(0)).map(|p| p.sequence).collect()
}

// ============================================================================
// INVARIANT: PARSER NEVER PANICS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    #[test]
    fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..200)) {
        let _ = RtpPacket::decode(&data);
    }

    #[test]
    fn prop_decode_malformed_is_rejected(data in malformed_rtp_packet()) {
        prop_assert!(RtpPacket::decode(&data).is_err());
    }

    #[test]
    fn prop_decode_valid_header((data, pt, seq, ts, ssrc) in valid_rtp_packet(160)) {
        let packet = RtpPacket::decode(&data).unwrap();
        prop_assert_eq!(packet.payload_type, pt);
        prop_assert_eq!(packet.sequence, seq);
        prop_assert_eq!(packet.timestamp, ts);
        prop_assert_eq!(packet.ssrc, ssrc);
        prop_assert_eq!(packet.payload.len(), 160);
    }
}

// ============================================================================
// INVARIANT: VERSION CHECK
// ============================================================================

#[test]
fn test_rejects_all_non_v2_versions() {
    let base_packet = [0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01];

    for version in [0u8, 1, 3] {
        let mut packet = base_packet;
        packet[0] = (version << 6) | (packet[0] & 0x3F);
        assert_eq!(
            RtpPacket::decode(&packet),
            Err(DecodeError::UnsupportedVersion(version)),
            "Version {} should be rejected",
            version
        );
    }
}

#[test]
fn test_accepts_v2() {
    let packet = [0x80, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01];
    assert!(RtpPacket::decode(&packet).is_ok());
}

// ============================================================================
// INVARIANT: PAYLOAD OFFSET CALCULATION
// ============================================================================

#[test]
fn test_csrc_offset_calculation() {
    // CC=15 (max), then 2 payload bytes
    let mut packet = vec![0x8F, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01];
    packet.extend(vec![0u8; 60]); // 15 CSRCs * 4 bytes
    packet.extend([0xAA, 0xBB]);

    let decoded = RtpPacket::decode(&packet).unwrap();
    assert_eq!(decoded.csrc.len(), 15);
    assert_eq!(&decoded.payload[..], &[0xAA, 0xBB]);
}

#[test]
fn test_extension_offset_calculation() {
    let packet = [
        0x90, 0x00, // V=2, X=1, CC=0
        0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01,
        0xBE, 0xDE, // Extension ID
        0x00, 0x01, // Extension length = 1 (4 bytes)
        0x00, 0x00, 0x00, 0x00, // Extension data
        0xAA, // Payload
    ];
    let decoded = RtpPacket::decode(&packet).unwrap();
    assert_eq!(&decoded.payload[..], &[0xAA]);
}

#[test]
fn test_extension_length_overflow_rejected() {
    let packet = vec![
        0x90, 0x00, // V=2, X=1
        0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01, // 12 bytes header
        0xBE, 0xDE, // Extension ID
        0xFF, 0xFF, // Extension length = 65535 words (way more than packet)
        0x00,
    ];

    match RtpPacket::decode(&packet) {
        Err(DecodeError::ExtensionOverrun { needed, len }) => {
            assert_eq!(needed, 12 + 4 + 65535 * 4);
            assert_eq!(len, packet.len());
        }
        other => panic!("expected extension overrun, got {:?}", other),
    }
}

#[test]
fn test_padding_consuming_whole_body() {
    // Four bytes of body, all of it padding
    let packet = [
        0xA0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x04,
    ];
    let decoded = RtpPacket::decode(&packet).unwrap();
    assert!(decoded.payload.is_empty());
}

// ============================================================================
// JITTER BUFFER: NEVER PANICS, STAYS BOUNDED
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn prop_jitter_buffer_never_panics(
        packets in proptest::collection::vec((any::<u16>(), any::<u32>(), 0i64..100_000), 0..200),
        read_decisions in proptest::collection::vec(any::<bool>(), 0..200),
        capacity in 2usize..64,
    ) {
        let buffer = buffer(60, capacity);

        for (i, (seq, ts, arrival)) in packets.iter().enumerate() {
            buffer.write_at(make_packet(*seq, *ts), *arrival);
            if read_decisions.get(i).copied().unwrap_or(false) {
                let _ = buffer.read(*arrival);
            }

            let stats = buffer.stats();
            prop_assert!(stats.buffered_ms >= 0, "buffered went negative: {}", stats.buffered_ms);
            prop_assert!(stats.occupied_slots <= capacity);
            prop_assert!(stats.jitter_ms >= 0.0);
            prop_assert!(stats.max_jitter_ms >= stats.jitter_ms);
        }

        // Drain at the end; must terminate
        let drained = drain(&buffer);
        prop_assert!(drained.len() <= capacity);
    }

    /// Packets written in order come out in order, all but the newest
    #[test]
    fn prop_jitter_buffer_contiguous(
        base in any::<u16>(),
        count in 2usize..90,
    ) {
        let buffer = buffer(20, 100);

        let sequences: Vec<u16> = (0..count).map(|i| base.wrapping_add(i as u16)).collect();
        for (i, &seq) in sequences.iter().enumerate() {
            buffer.write_at(make_packet(seq, i as u32 * 160), i as i64 * 20);
        }

        let output = drain(&buffer);
        prop_assert_eq!(&output[..], &sequences[..count - 1]);
        prop_assert_eq!(buffer.stats().overrun_drops, 0);
    }

    /// Wraparound in the middle of a run does not break ordering
    #[test]
    fn prop_jitter_buffer_wraparound_from_offset(start_offset in 0u16..10u16) {
        let buffer = buffer(0, 20);

        let sequences: Vec<u16> = (65533u16..=65535)
            .chain(0..6)
            .map(|s| s.wrapping_add(start_offset))
            .collect();

        for (i, &seq) in sequences.iter().enumerate() {
            buffer.write_at(make_packet(seq, i as u32 * 160), i as i64 * 20);
        }

        let output = drain(&buffer);
        prop_assert_eq!(output.len(), 8);
        prop_assert_eq!(&output[..], &sequences[..8]);
    }
}

// ============================================================================
// JITTER BUFFER: MAX SIZE ENFORCEMENT
// ============================================================================

#[test]
fn test_jitter_buffer_enforces_capacity() {
    let buffer = buffer(60, 10);

    for seq in 0..1000u16 {
        buffer.write_at(make_packet(seq, seq as u32 * 160), seq as i64 * 20);
    }

    let stats = buffer.stats();
    assert_eq!(stats.occupied_slots, 10);
    assert_eq!(stats.overrun_drops, 990);
    assert_eq!(stats.buffered_ms, 180);
}

#[test]
fn test_jitter_buffer_drops_oldest_on_overflow() {
    let buffer = buffer(20, 5);

    for seq in 0..10u16 {
        buffer.write_at(make_packet(seq, seq as u32 * 160), seq as i64 * 20);
    }

    // 0-4 were evicted, 9 has no duration yet
    assert_eq!(drain(&buffer), vec![5, 6, 7, 8]);
}

// ============================================================================
// JITTER BUFFER: REORDERING, DUPLICATES, LATE FLOODS
// ============================================================================

#[test]
fn test_locally_shuffled_delivery_is_repaired() {
    for seed in 0..50u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<u16> = (0..200).collect();
        for chunk in order.chunks_mut(4) {
            chunk.shuffle(&mut rng);
        }

        let buffer = buffer(60, 512);
        for (i, &seq) in order.iter().enumerate() {
            let arrival = i as i64 * 20 + rng.gen_range(0..15);
            buffer.write_at(make_packet(seq, seq as u32 * 160), arrival);
        }

        // Anything older than the first arrival has no slot left
        let first = order[0];
        let output = drain(&buffer);
        let expected: Vec<u16> = (first..199).collect();
        assert_eq!(output, expected, "seed {}", seed);
        assert_eq!(buffer.stats().late_drops, first as u64, "seed {}", seed);
        assert_eq!(buffer.stats().buffered_ms, 0);
    }
}

#[test]
fn test_duplicate_storm() {
    let buffer = buffer(60, 100);

    for seq in 0..50u16 {
        for _ in 0..3 {
            buffer.write_at(make_packet(seq, seq as u32 * 160), seq as i64 * 20);
        }
    }

    let stats = buffer.stats();
    assert_eq!(stats.duplicates, 100);
    assert_eq!(stats.packets_written, 150);
    assert_eq!(stats.buffered_ms, 49 * 20);
    assert_eq!(drain(&buffer), (0..49).collect::<Vec<u16>>());
}

#[test]
fn test_late_packet_flood_after_playout() {
    let buffer = buffer(40, 100);

    for seq in 0..20u16 {
        buffer.write_at(make_packet(seq, seq as u32 * 160), seq as i64 * 20);
    }
    for _ in 0..10 {
        buffer.read(0);
    }
    let before = buffer.stats();

    // Replay everything already played
    for seq in 0..10u16 {
        buffer.write_at(make_packet(seq, seq as u32 * 160), 1000);
    }

    let after = buffer.stats();
    assert_eq!(after.late_drops, 10);
    assert_eq!(after.buffered_ms, before.buffered_ms);
    assert_eq!(after.occupied_slots, before.occupied_slots);
    assert_eq!(drain(&buffer), (10..19).collect::<Vec<u16>>());
}

#[test]
fn test_random_sequence_noise_stays_consistent() {
    let mut rng = StdRng::seed_from_u64(7);
    let buffer = buffer(60, 32);

    for i in 0..5000i64 {
        let seq: u16 = rng.gen();
        let ts: u32 = rng.gen();
        buffer.write_at(make_packet(seq, ts), i * 20);
        if rng.gen_bool(0.5) {
            buffer.read(i * 20);
        }
        let stats = buffer.stats();
        assert!(stats.buffered_ms >= 0);
        assert!(stats.occupied_slots <= 32);
    }

    buffer.reset();
    assert_eq!(buffer.stats(), JitterBufferStats::default());
}
