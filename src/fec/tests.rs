//! Encoder/decoder scenario tests.

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::error::DecodeError;
    use crate::fec::protocol::{RedundancyHeader, REDUNDANCY_MARKER};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// Encode one full group, returning (data, redundancy) packets.
    fn encode_group(params: FecParams, payloads: &[Vec<u8>]) -> (Vec<Packet>, Vec<Packet>) {
        let mut encoder = FecEncoder::new(params);
        let mut packets = Vec::new();
        for payload in payloads {
            packets.extend(encoder.submit(payload).unwrap());
        }
        packets.extend(encoder.flush());
        packets
            .into_iter()
            .partition(|p| p.kind == PacketKind::Data)
    }

    fn varied_payloads(k: usize, seed: u64) -> Vec<Vec<u8>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..k)
            .map(|_| {
                let len = rng.gen_range(1..=300);
                (0..len).map(|_| rng.gen()).collect()
            })
            .collect()
    }

    fn decoder_for(params: &FecParams) -> FecDecoder {
        FecDecoder::new(DecoderConfig::for_params(params))
    }

    #[test]
    fn test_single_loss_recovered_exactly() {
        let params = FecParams::new(10, 0.10).unwrap();
        let payloads = varied_payloads(10, 1);

        for lost in 0..10 {
            let (data, redundancy) = encode_group(params, &payloads);
            assert_eq!(redundancy.len(), 1);
            let decoder = decoder_for(&params);

            for packet in data.iter().filter(|p| p.index != lost) {
                let delivered = decoder.receive(&packet.datagram).unwrap();
                assert_eq!(delivered.len(), 1);
                assert!(!delivered[0].recovered);
            }

            let recovery = decoder.add_redundancy_packet(&redundancy[0].datagram).unwrap();
            assert!(recovery.recovered);
            assert_eq!(recovery.packets.len(), 1);
            assert_eq!(recovery.packets[0].packet_index, lost);
            assert_eq!(recovery.packets[0].payload, payloads[lost as usize]);

            assert_eq!(decoder.group_state(0), Some(GroupState::Complete));
            let counters = decoder.stats().snapshot();
            assert_eq!(counters.recovered_packets, 1);
            assert_eq!(counters.open_groups, 0);
        }
    }

    #[test]
    fn test_two_losses_never_report_recovery() {
        let params = FecParams::new(10, 0.10).unwrap();
        let payloads = varied_payloads(10, 2);
        let (data, redundancy) = encode_group(params, &payloads);
        let decoder = decoder_for(&params);

        for packet in data.iter().filter(|p| p.index != 3 && p.index != 7) {
            let recovery = decoder
                .add_packet(packet.group_id, packet.index, &payloads[packet.index as usize])
                .unwrap();
            assert!(!recovery.recovered);
        }
        let recovery = decoder.add_redundancy_packet(&redundancy[0].datagram).unwrap();
        assert!(!recovery.recovered);
        assert!(recovery.packets.is_empty());
        assert_eq!(decoder.group_state(0), Some(GroupState::Open));

        let report = decoder.drain();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.unrecoverable, 1);
        assert_eq!(decoder.stats().snapshot().unrecoverable_groups, 1);
        assert_eq!(decoder.stats().snapshot().recovered_packets, 0);
    }

    #[test]
    fn test_redundancy_before_data() {
        let params = FecParams::new(10, 0.10).unwrap();
        let payloads = varied_payloads(10, 3);
        let (data, redundancy) = encode_group(params, &payloads);
        let decoder = decoder_for(&params);

        assert!(!decoder.receive(&redundancy[0].datagram).unwrap().iter().any(|d| d.recovered));

        // Lose packet 0; the ninth arrival completes the group.
        let mut rebuilt = Vec::new();
        for packet in data.iter().skip(1) {
            rebuilt.extend(decoder.receive(&packet.datagram).unwrap());
        }
        let rebuilt: Vec<_> = rebuilt.into_iter().filter(|d| d.recovered).collect();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].packet_index, 0);
        assert_eq!(rebuilt[0].payload, payloads[0]);
    }

    #[test]
    fn test_two_parities_recover_two_losses() {
        let params = FecParams::new(10, 0.20).unwrap();
        assert_eq!(params.repair_count(), 2);
        let payloads = varied_payloads(10, 4);
        let (data, redundancy) = encode_group(params, &payloads);
        let decoder = decoder_for(&params);

        for packet in data.iter().filter(|p| p.index != 2 && p.index != 9) {
            decoder.receive(&packet.datagram).unwrap();
        }
        let first = decoder.receive(&redundancy[0].datagram).unwrap();
        assert!(first.is_empty());
        let second = decoder.receive(&redundancy[1].datagram).unwrap();

        assert_eq!(second.len(), 2);
        assert_eq!(second[0].packet_index, 2);
        assert_eq!(second[0].payload, payloads[2]);
        assert_eq!(second[1].packet_index, 9);
        assert_eq!(second[1].payload, payloads[9]);
    }

    #[test]
    fn test_recovery_without_xor_row() {
        let params = FecParams::new(15, 0.20).unwrap();
        assert_eq!(params.repair_count(), 3);
        let payloads = varied_payloads(15, 5);
        let (data, redundancy) = encode_group(params, &payloads);
        let decoder = decoder_for(&params);

        for packet in data.iter().filter(|p| p.index != 0 && p.index != 14) {
            decoder.receive(&packet.datagram).unwrap();
        }
        // Parity 0 is lost; rows 1 and 2 must suffice.
        decoder.receive(&redundancy[1].datagram).unwrap();
        let rebuilt = decoder.receive(&redundancy[2].datagram).unwrap();

        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt[0].payload, payloads[0]);
        assert_eq!(rebuilt[1].payload, payloads[14]);
    }

    #[test]
    fn test_three_losses_three_parities() {
        let params = FecParams::new(15, 0.20).unwrap();
        let payloads = varied_payloads(15, 6);
        let (data, redundancy) = encode_group(params, &payloads);
        let decoder = decoder_for(&params);

        let lost = [1u16, 7, 8];
        for packet in data.iter().filter(|p| !lost.contains(&p.index)) {
            decoder.receive(&packet.datagram).unwrap();
        }
        let mut rebuilt = Vec::new();
        for packet in &redundancy {
            rebuilt.extend(decoder.receive(&packet.datagram).unwrap());
        }

        assert_eq!(rebuilt.len(), 3);
        for (delivery, &index) in rebuilt.iter().zip(&lost) {
            assert_eq!(delivery.packet_index, index);
            assert_eq!(delivery.payload, payloads[index as usize]);
        }
    }

    #[test]
    fn test_short_group_recovery() {
        let params = FecParams::new(10, 0.10).unwrap();
        let payloads = varied_payloads(3, 7);
        let (data, redundancy) = encode_group(params, &payloads);
        assert_eq!(data.len(), 3);

        let (header, _) = RedundancyHeader::decode(&redundancy[0].datagram).unwrap();
        assert_eq!(header.k, 3);

        let decoder = decoder_for(&params);
        decoder.receive(&data[0].datagram).unwrap();
        decoder.receive(&data[2].datagram).unwrap();
        let rebuilt = decoder.receive(&redundancy[0].datagram).unwrap();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].payload, payloads[1]);
    }

    #[test]
    fn test_duplicates_ignored() {
        let params = FecParams::new(4, 0.20).unwrap();
        let payloads = varied_payloads(4, 8);
        let (data, redundancy) = encode_group(params, &payloads);
        let decoder = decoder_for(&params);

        assert_eq!(decoder.receive(&data[0].datagram).unwrap().len(), 1);
        assert!(decoder.receive(&data[0].datagram).unwrap().is_empty());

        decoder.receive(&data[1].datagram).unwrap();
        decoder.receive(&data[2].datagram).unwrap();
        let rebuilt = decoder.receive(&redundancy[0].datagram).unwrap();
        assert_eq!(rebuilt.len(), 1);

        // The lost packet shows up late; the group is already complete.
        assert!(decoder.receive(&data[3].datagram).unwrap().is_empty());
        assert!(decoder.receive(&redundancy[0].datagram).unwrap().is_empty());

        let counters = decoder.stats().snapshot();
        assert_eq!(counters.data_packets, 3);
        assert_eq!(counters.duplicate_packets, 3);
        assert_eq!(counters.recovered_packets, 1);
    }

    #[test]
    fn test_complete_without_redundancy() {
        let params = FecParams::new(4, 0.20).unwrap();
        let payloads = varied_payloads(4, 9);
        let (data, _) = encode_group(params, &payloads);
        let decoder = decoder_for(&params);

        for packet in &data {
            decoder.receive(&packet.datagram).unwrap();
        }
        assert_eq!(decoder.group_state(0), Some(GroupState::Complete));
        assert_eq!(decoder.open_groups(), 0);
    }

    #[test]
    fn test_malformed_packets_counted() {
        let params = FecParams::new(4, 0.20).unwrap();
        let payloads = varied_payloads(4, 10);
        let (data, redundancy) = encode_group(params, &payloads);
        let decoder = decoder_for(&params);

        // Truncated header.
        let err = decoder.receive(&REDUNDANCY_MARKER).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));

        // Parity payload cut short.
        let mut short = redundancy[0].datagram.clone();
        short.pop();
        assert!(matches!(
            decoder.receive(&short),
            Err(DecodeError::LengthMismatch { .. })
        ));

        // Data packet too short for its header.
        assert!(decoder.receive(&[0u8; 4]).is_err());

        assert_eq!(decoder.stats().snapshot().malformed_packets, 3);

        // The decoder keeps working.
        for packet in data.iter().skip(1) {
            decoder.receive(&packet.datagram).unwrap();
        }
        let rebuilt = decoder.receive(&redundancy[0].datagram).unwrap();
        assert_eq!(rebuilt[0].payload, payloads[0]);
    }

    #[test]
    fn test_data_length_disagrees_with_table() {
        let params = FecParams::new(4, 0.20).unwrap();
        let payloads = varied_payloads(4, 11);
        let (_, redundancy) = encode_group(params, &payloads);
        let decoder = decoder_for(&params);

        decoder.receive(&redundancy[0].datagram).unwrap();
        let bogus = vec![0u8; payloads[1].len() + 1];
        assert!(matches!(
            decoder.add_packet(0, 1, &bogus),
            Err(DecodeError::LengthMismatch { .. })
        ));
        assert!(matches!(
            decoder.add_packet(0, 4, &payloads[0]),
            Err(DecodeError::DataIndexOutOfRange { index: 4, k: 4 })
        ));
    }

    #[test]
    fn test_inconsistent_redundancy_header() {
        let params = FecParams::new(4, 0.20).unwrap();
        let decoder = decoder_for(&params);

        let (_, a) = encode_group(params, &varied_payloads(4, 12));
        let (_, b) = encode_group(params, &varied_payloads(3, 13));
        decoder.receive(&a[0].datagram).unwrap();

        // Same group id and parity index, different shape.
        assert_eq!(
            decoder.receive(&b[0].datagram).unwrap_err(),
            DecodeError::InconsistentGroup { group_id: 0 }
        );
    }

    #[test]
    fn test_cleanup_evicts_by_age_regardless_of_state() {
        let params = FecParams::new(4, 0.20).unwrap();
        let decoder = FecDecoder::new(DecoderConfig {
            group_size: 4,
            retention: Duration::from_millis(500),
            shards: 4,
            redundancy: true,
        });

        let mut encoder = FecEncoder::new(params);
        let mut wire = Vec::new();
        for i in 0..12u8 {
            wire.extend(encoder.submit(&[i; 16]).unwrap());
        }
        // Group 0 complete, group 1 recoverable then complete, group 2 lossy.
        for packet in &wire {
            let lose = (packet.group_id == 1 && packet.index == 0 && packet.kind == PacketKind::Data)
                || (packet.group_id == 2 && packet.kind == PacketKind::Data && packet.index < 2);
            if !lose {
                decoder.receive(&packet.datagram).unwrap();
            }
        }
        assert_eq!(decoder.group_count(), 3);
        assert_eq!(decoder.open_groups(), 1);

        let report = decoder.cleanup_groups_at(Instant::now());
        assert_eq!(report.evicted, 0);

        let report = decoder.cleanup_groups_at(Instant::now() + Duration::from_millis(500));
        assert_eq!(report.evicted, 3);
        assert_eq!(report.unrecoverable, 1);
        assert_eq!(decoder.group_count(), 0);
        assert_eq!(decoder.open_groups(), 0);
        assert_eq!(decoder.group_state(2), Some(GroupState::Expired));
        assert_eq!(decoder.group_state(3), None);
        assert_eq!(decoder.stats().snapshot().expired_groups, 3);
    }

    #[test]
    fn test_late_packets_for_expired_group_dropped() {
        let params = FecParams::new(4, 0.20).unwrap();
        let payloads = varied_payloads(4, 16);
        let (data, redundancy) = encode_group(params, &payloads);
        let decoder = decoder_for(&params);

        for packet in data.iter().skip(1) {
            decoder.receive(&packet.datagram).unwrap();
        }
        let report = decoder.drain();
        assert_eq!(report.unrecoverable, 1);
        assert_eq!(decoder.group_state(0), Some(GroupState::Expired));

        // Stragglers must not reopen the group and count it a second time.
        assert!(decoder.receive(&data[0].datagram).unwrap().is_empty());
        assert!(decoder.receive(&redundancy[0].datagram).unwrap().is_empty());
        assert_eq!(decoder.group_count(), 0);
        assert_eq!(decoder.open_groups(), 0);

        let report = decoder.drain();
        assert_eq!(report, CleanupReport::default());

        let counters = decoder.stats().snapshot();
        assert_eq!(counters.late_packets, 2);
        assert_eq!(counters.data_packets, 3);
        assert_eq!(counters.unrecoverable_groups, 1);
    }

    #[test]
    fn test_short_group_with_lost_redundancy_not_unrecoverable() {
        let params = FecParams::new(10, 0.10).unwrap();
        let payloads = varied_payloads(3, 17);
        let (data, redundancy) = encode_group(params, &payloads);
        assert_eq!(data.len(), 3);
        assert_eq!(redundancy.len(), 1);

        let decoder = decoder_for(&params);
        for packet in &data {
            assert_eq!(decoder.receive(&packet.datagram).unwrap().len(), 1);
        }
        assert_eq!(decoder.group_state(0), Some(GroupState::Open));

        let report = decoder.drain();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.unrecoverable, 0);
        assert_eq!(report.unverified, 1);

        let counters = decoder.stats().snapshot();
        assert_eq!(counters.unrecoverable_groups, 0);
        assert_eq!(counters.unverified_groups, 1);
        assert_eq!(counters.open_groups, 0);
    }

    #[test]
    fn test_short_groups_without_redundancy_not_counted() {
        let params = FecParams::new(10, 0.10).unwrap();
        let mut encoder = FecEncoder::with_config(params, Duration::from_millis(20), false);
        let decoder = FecDecoder::new(DecoderConfig {
            redundancy: false,
            ..DecoderConfig::for_params(&params)
        });

        // Two flushed short groups and one full group, nothing lost.
        let mut wire = Vec::new();
        for len in [4usize, 7, 10] {
            for i in 0..len {
                wire.extend(encoder.submit(&[i as u8; 32]).unwrap());
            }
            wire.extend(encoder.flush());
        }
        assert!(wire.iter().all(|p| p.kind == PacketKind::Data));
        for packet in &wire {
            decoder.receive(&packet.datagram).unwrap();
        }

        let report = decoder.drain();
        assert_eq!(report.evicted, 3);
        assert_eq!(report.unrecoverable, 0);
        assert_eq!(report.unverified, 0);

        let counters = decoder.stats().snapshot();
        assert_eq!(counters.unrecoverable_groups, 0);
        assert_eq!(counters.completed_groups, 1);
    }

    #[test]
    fn test_gap_without_header_is_unrecoverable() {
        let params = FecParams::new(10, 0.10).unwrap();
        let payloads = varied_payloads(10, 18);
        let decoder = decoder_for(&params);

        // Group 0 loses slot 2 and its parity: the gap proves the loss.
        // Group 1 loses slot 9 and its parity: the group may have been short.
        let mut encoder = FecEncoder::new(params);
        for payload in payloads.iter().chain(&payloads) {
            for packet in encoder.submit(payload).unwrap() {
                let lost = packet.kind == PacketKind::Redundancy
                    || (packet.group_id == 0 && packet.index == 2)
                    || (packet.group_id == 1 && packet.index == 9);
                if !lost {
                    decoder.receive(&packet.datagram).unwrap();
                }
            }
        }

        let report = decoder.drain();
        assert_eq!(report.evicted, 2);
        assert_eq!(report.unrecoverable, 1);
        assert_eq!(report.unverified, 1);
    }

    #[test]
    fn test_stray_data_before_header_does_not_poison_redundancy() {
        let params = FecParams::new(10, 0.10).unwrap();
        let payloads = varied_payloads(4, 19);
        let (data, redundancy) = encode_group(params, &payloads);
        assert_eq!(data.len(), 4);
        let decoder = decoder_for(&params);

        // Slot 1 with the wrong length stands in for the lost original, and
        // slot 6 lies beyond the group the header will announce.
        let wrong = vec![0x5a; payloads[1].len() + 3];
        decoder.add_packet(0, 1, &wrong).unwrap();
        decoder.add_packet(0, 6, &payloads[0]).unwrap();
        for packet in data.iter().filter(|p| p.index != 1) {
            decoder.receive(&packet.datagram).unwrap();
        }

        let rebuilt = decoder.receive(&redundancy[0].datagram).unwrap();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].packet_index, 1);
        assert_eq!(rebuilt[0].payload, payloads[1]);
        assert!(rebuilt[0].recovered);
        assert_eq!(decoder.group_state(0), Some(GroupState::Complete));

        let counters = decoder.stats().snapshot();
        assert_eq!(counters.malformed_packets, 2);
        assert_eq!(counters.redundancy_packets, 1);
        assert_eq!(counters.recovered_packets, 1);
    }

    #[test]
    fn test_memory_bounded_under_sustained_loss() {
        let params = FecParams::new(10, 0.10).unwrap();
        let decoder = FecDecoder::new(DecoderConfig {
            retention: Duration::from_millis(100),
            ..DecoderConfig::for_params(&params)
        });
        let mut encoder = FecEncoder::new(params);
        let mut rng = ChaCha8Rng::seed_from_u64(14);

        for _round in 0..50 {
            for _ in 0..100 {
                for packet in encoder.submit(&[0xab; 64]).unwrap() {
                    // Heavy loss on both data and redundancy.
                    if rng.gen::<f64>() >= 0.5 {
                        let _ = decoder.receive(&packet.datagram);
                    }
                }
            }
            assert!(decoder.group_count() <= 10);
            decoder.cleanup_groups_at(Instant::now() + Duration::from_millis(100));
            assert_eq!(decoder.group_count(), 0);
        }

        let counters = decoder.stats().snapshot();
        assert_eq!(counters.open_groups, 0);
        assert!(counters.expired_groups > 0 && counters.expired_groups <= 500);
    }

    #[test]
    fn test_concurrent_producers() {
        let params = FecParams::new(8, 0.10).unwrap();
        let decoder = Arc::new(decoder_for(&params));

        let mut encoder = FecEncoder::new(params);
        let mut wire = Vec::new();
        for i in 0..(8 * 64) {
            wire.extend(encoder.submit(&(i as u32).to_be_bytes()).unwrap());
        }
        // Drop data packet 5 of every group.
        let wire: Vec<Packet> = wire
            .into_iter()
            .filter(|p| !(p.kind == PacketKind::Data && p.index == 5))
            .collect();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let decoder = Arc::clone(&decoder);
                let wire = &wire;
                scope.spawn(move || {
                    for packet in wire.iter().skip(worker).step_by(4) {
                        decoder.receive(&packet.datagram).unwrap();
                    }
                });
            }
        });

        let counters = decoder.stats().snapshot();
        assert_eq!(counters.recovered_groups, 64);
        assert_eq!(counters.recovered_packets, 64);
        assert_eq!(counters.completed_groups, 64);
        assert_eq!(counters.duplicate_packets, 0);
        assert_eq!(counters.open_groups, 0);
    }

    #[test]
    fn test_simd_and_scalar_parity_identical() {
        let mut rng = ChaCha8Rng::seed_from_u64(15);
        for r in 1..=3u8 {
            for k in [1usize, 2, 10, 33] {
                let payloads = varied_payloads(k, rng.gen());
                let fast = compute_redundancy(42, &payloads, r);
                let slow = compute_redundancy_scalar(42, &payloads, r);
                assert_eq!(fast, slow, "k={} r={}", k, r);
            }
        }
    }
}
