//! Bulk-Only transport and SCSI command tests over the loopback host
//!
//! These tests drive a running gadget exactly as a host would:
//! - Identification and capacity commands
//! - READ(10)/WRITE(10) data integrity, including transfers that need chunking
//! - Sense reporting and its reset semantics
//! - Write protection
//! - Malformed wrappers
//! - Link loss and recovery

mod common;

use common::*;
use std::time::Duration;
use ums_gadget::bot::{Cbw, CswStatus, DataDirection, CBW_SIGNATURE};
use ums_gadget::controller::{ControllerKind, EndpointKind};

const BLOCK: u32 = 512;

// ============================================================================
// Reference Scenario
// ============================================================================

#[test]
fn test_capacity_read_and_out_of_range_scenario() {
    let mut rig = TestRig::high_speed(1000, BLOCK);
    let mut host = rig.start_and_connect();

    // READ CAPACITY: last LBA 999, 512 byte blocks, both big-endian
    let (data, csw) = host.command_in(&read_capacity(1), 8).unwrap();
    assert_good(&csw, 1);
    assert_eq!(data, vec![0x00, 0x00, 0x03, 0xE7, 0x00, 0x00, 0x02, 0x00]);

    // READ(10) lba 0, 2 blocks
    let (data, csw) = host.command_in(&read10(2, 0, 2, BLOCK), 1024).unwrap();
    assert_good(&csw, 2);
    assert_eq!(data, rig.contents()[..1024].to_vec());

    // READ(10) lba 999, 2 blocks runs off the end
    let reads_before = rig.stats.reads();
    let csw = host.command(&read10(3, 999, 2, BLOCK)).unwrap();
    assert_failed(&csw, 3, 1024);
    assert_eq!(rig.stats.reads(), reads_before, "no backing I/O for a bad range");

    let (key, asc, _) = fetch_sense(&mut host, 4);
    assert_eq!(key, 0x05); // ILLEGAL REQUEST
    assert_eq!(asc, 0x24);

    rig.gadget.exit();
}

// ============================================================================
// Identification
// ============================================================================

#[test]
fn test_inquiry_reports_identity() {
    let mut rig = TestRig::new(ControllerKind::HighSpeed, 64, BLOCK, |b| {
        b.inquiry("Acme", "Boot Disk", "2.1")
    });
    let mut host = rig.start_and_connect();

    let inquiry = Cbw::new(7, 36, DataDirection::In, &[0x12, 0, 0, 0, 36, 0]);
    let (data, csw) = host.command_in(&inquiry, 36).unwrap();
    assert_good(&csw, 7);
    assert_eq!(data[0], 0x00);
    assert_eq!(data[1], 0x80);
    assert_eq!(&data[8..16], b"Acme    ");
    assert_eq!(&data[16..32], b"Boot Disk       ");
    assert_eq!(&data[32..36], b"2.1 ");
}

#[test]
fn test_inquiry_capped_to_host_length() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();

    let inquiry = Cbw::new(8, 5, DataDirection::In, &[0x12, 0, 0, 0, 5, 0]);
    let (data, csw) = host.command_in(&inquiry, 5).unwrap();
    assert_good(&csw, 8);
    assert_eq!(data.len(), 5);
    assert_eq!(data[4], 31);
    assert_eq!(rig.controller.queued_lengths(EndpointKind::BulkIn), vec![5, 13]);
}

#[test]
fn test_test_unit_ready_and_no_op_commands() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();

    assert_good(&host.command(&test_unit_ready(1)).unwrap(), 1);

    let start_stop = Cbw::new(2, 0, DataDirection::Out, &[0x1B, 0, 0, 0, 1, 0]);
    assert_good(&host.command(&start_stop).unwrap(), 2);

    let allow_removal = Cbw::new(3, 0, DataDirection::Out, &[0x1E, 0, 0, 0, 0, 0]);
    assert_good(&host.command(&allow_removal).unwrap(), 3);

    let verify = Cbw::new(4, 0, DataDirection::Out, &[0x2F, 0, 0, 0, 0, 0, 0, 0, 8, 0]);
    assert_good(&host.command(&verify).unwrap(), 4);
}

#[test]
fn test_mode_sense_reflects_write_protect() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();
    let mode_sense = Cbw::new(5, 4, DataDirection::In, &[0x1A, 0, 0x3F, 0, 4, 0]);
    let (data, csw) = host.command_in(&mode_sense, 4).unwrap();
    assert_good(&csw, 5);
    assert_eq!(data, vec![3, 0, 0x00, 0]);
    rig.gadget.exit();

    let mut rig = TestRig::new(ControllerKind::HighSpeed, 64, BLOCK, |b| b.read_only(true));
    let mut host = rig.start_and_connect();
    let (data, _) = host.command_in(&mode_sense, 4).unwrap();
    assert_eq!(data, vec![3, 0, 0x80, 0]);
}

// ============================================================================
// Block I/O
// ============================================================================

#[test]
fn test_write_then_read_back() {
    let mut rig = TestRig::high_speed(256, BLOCK);
    let mut host = rig.start_and_connect();

    let payload = pattern(0x5A, 4 * BLOCK as usize);
    let csw = host.command_out(&write10(10, 17, 4, BLOCK), &payload).unwrap();
    assert_good(&csw, 10);

    let contents = rig.contents();
    assert_eq!(&contents[17 * 512..21 * 512], &payload[..]);
    // Neighbouring blocks untouched
    assert_eq!(&contents[16 * 512..17 * 512], &pattern(0, 256 * 512)[16 * 512..17 * 512]);

    let (data, csw) = host.command_in(&read10(11, 17, 4, BLOCK), payload.len()).unwrap();
    assert_good(&csw, 11);
    assert_eq!(data, payload);
}

#[test]
fn test_large_read_is_chunked_transparently() {
    let mut rig = TestRig::high_speed(1000, BLOCK);
    let mut host = rig.start_and_connect();
    rig.controller.clear_queued_log();

    // 600 blocks: several transfer buffers, each split into 32 KiB requests
    let len = 600 * 512;
    let (data, csw) = host.command_in(&read10(20, 100, 600, BLOCK), len).unwrap();
    assert_good(&csw, 20);
    assert_eq!(data, rig.contents()[100 * 512..700 * 512].to_vec());

    let in_lengths = rig.controller.queued_lengths(EndpointKind::BulkIn);
    let (csw_len, data_lengths) = in_lengths.split_last().unwrap();
    assert_eq!(*csw_len, 13);
    assert!(data_lengths.iter().all(|&l| l <= 32 * 1024));
    assert_eq!(data_lengths.iter().sum::<usize>(), len);
}

#[test]
fn test_large_write_with_small_buffer() {
    let mut rig = TestRig::new(ControllerKind::HighSpeed, 128, BLOCK, |b| b.max_buffer_size(4096));
    let mut host = rig.start_and_connect();
    // Let the first CBW read get queued before clearing the log
    assert!(host.has_pending_out(Duration::from_secs(1)));
    rig.controller.clear_queued_log();

    // 20 blocks through an 8-block buffer: chunks of 8, 8 and 4 blocks
    let payload = pattern(0x11, 20 * 512);
    let csw = host.command_out(&write10(30, 50, 20, BLOCK), &payload).unwrap();
    assert_good(&csw, 30);
    assert_eq!(&rig.contents()[50 * 512..70 * 512], &payload[..]);

    let out_lengths = rig.controller.queued_lengths(EndpointKind::BulkOut);
    assert_eq!(&out_lengths[..3], &[4096, 4096, 2048]);
    assert_eq!(rig.stats.writes(), 3);
}

#[test]
fn test_superspeed_large_read() {
    let mut rig = TestRig::new(ControllerKind::SuperSpeed, 2048, BLOCK, |b| b.max_buffer_size(1024 * 1024));
    let mut host = rig.start_and_connect();
    rig.controller.clear_queued_log();

    let len = 2048 * 512;
    let (data, csw) = host.command_in(&read10(40, 0, 2048, BLOCK), len).unwrap();
    assert_good(&csw, 40);
    assert_eq!(data, rig.contents());
    // The whole buffer moves in a single request
    assert_eq!(rig.controller.queued_lengths(EndpointKind::BulkIn), vec![len, 13]);
}

#[test]
fn test_4k_block_device() {
    let mut rig = TestRig::high_speed(64, 4096);
    let mut host = rig.start_and_connect();

    let (data, csw) = host.command_in(&read_capacity(1), 8).unwrap();
    assert_good(&csw, 1);
    assert_eq!(&data[0..4], &63u32.to_be_bytes());
    assert_eq!(&data[4..8], &4096u32.to_be_bytes());

    let (data, csw) = host.command_in(&read10(2, 63, 1, 4096), 4096).unwrap();
    assert_good(&csw, 2);
    assert_eq!(data, rig.contents()[63 * 4096..].to_vec());
}

#[test]
fn test_read_error_reports_medium_error() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();

    rig.stats.set_fail_reads(true);
    let csw = host.command(&read10(50, 0, 1, BLOCK)).unwrap();
    assert_failed(&csw, 50, 512);

    let (key, asc, _) = fetch_sense(&mut host, 51);
    assert_eq!(key, 0x03); // MEDIUM ERROR
    assert_eq!(asc, 0x11);

    // The session carries on once the fault clears
    rig.stats.set_fail_reads(false);
    let (_, csw) = host.command_in(&read10(52, 0, 1, BLOCK), 512).unwrap();
    assert_good(&csw, 52);
}

#[test]
fn test_write_error_reports_medium_error() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();

    rig.stats.set_fail_writes(true);
    let csw = host.command_out(&write10(60, 3, 1, BLOCK), &[0xEE; 512]).unwrap();
    assert_failed(&csw, 60, 512);

    let (key, asc, _) = fetch_sense(&mut host, 61);
    assert_eq!(key, 0x03);
    assert_eq!(asc, 0x0C);
}

#[test]
fn test_write_out_of_range_moves_no_data() {
    let mut rig = TestRig::high_speed(100, BLOCK);
    let mut host = rig.start_and_connect();

    let csw = host.command(&write10(70, 100, 1, BLOCK)).unwrap();
    assert_failed(&csw, 70, 512);
    assert_eq!(rig.stats.writes(), 0);

    let (key, _, _) = fetch_sense(&mut host, 71);
    assert_eq!(key, 0x05);
}

// ============================================================================
// Sense and Write Protection
// ============================================================================

#[test]
fn test_request_sense_clears_after_reporting() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();

    let bogus = Cbw::new(80, 0, DataDirection::Out, &[0xFF, 0, 0, 0, 0, 0]);
    let csw = host.command(&bogus).unwrap();
    assert_failed(&csw, 80, 0);

    assert_eq!(fetch_sense(&mut host, 81), (0x05, 0x20, 0x00));
    // A second immediate REQUEST SENSE returns NO SENSE
    assert_eq!(fetch_sense(&mut host, 82), (0x00, 0x00, 0x00));
}

#[test]
fn test_latest_failure_replaces_sense() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();

    let bogus = Cbw::new(90, 0, DataDirection::Out, &[0xA0, 0, 0, 0, 0, 0]);
    host.command(&bogus).unwrap();
    host.command(&read10(91, 64, 1, BLOCK)).unwrap();

    assert_eq!(fetch_sense(&mut host, 92), (0x05, 0x24, 0x00));
}

#[test]
fn test_write_protected_device() {
    let mut rig = TestRig::new(ControllerKind::HighSpeed, 64, BLOCK, |b| b.read_only(true));
    let mut host = rig.start_and_connect();
    let before = rig.contents();

    let csw = host.command(&write10(100, 0, 1, BLOCK)).unwrap();
    assert_failed(&csw, 100, 512);
    assert_eq!(rig.stats.writes(), 0);
    assert_eq!(rig.contents(), before);

    assert_eq!(fetch_sense(&mut host, 101), (0x05, 0x27, 0x00));

    // Reads still work
    let (_, csw) = host.command_in(&read10(102, 0, 1, BLOCK), 512).unwrap();
    assert_good(&csw, 102);
}

// ============================================================================
// Malformed Wrappers
// ============================================================================

#[test]
fn test_bad_signature_is_dropped_without_csw() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();

    // Leave a pending sense to show it survives the bad wrapper
    let bogus = Cbw::new(110, 0, DataDirection::Out, &[0xFF, 0, 0, 0, 0, 0]);
    host.command(&bogus).unwrap();

    let mut bad = test_unit_ready(111);
    bad.signature = CBW_SIGNATURE ^ 0xFFFF_FFFF;
    assert_eq!(host.send_raw(&bad.to_bytes()).unwrap(), 31);
    assert!(!host.has_pending_in(Duration::from_millis(100)));

    // The loop is back to waiting for a CBW
    assert!(host.has_pending_out(Duration::from_secs(1)));
    assert_eq!(fetch_sense(&mut host, 112), (0x05, 0x20, 0x00));
}

#[test]
fn test_short_cbw_is_dropped_without_csw() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();

    let bytes = test_unit_ready(120).to_bytes();
    assert_eq!(host.send_raw(&bytes[..13]).unwrap(), 13);
    assert!(!host.has_pending_in(Duration::from_millis(100)));

    let csw = host.command(&test_unit_ready(121)).unwrap();
    assert_good(&csw, 121);
}

#[test]
fn test_csw_tag_echo_across_commands() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();

    for tag in [0u32, 1, 0xDEAD_BEEF, u32::MAX] {
        let csw = host.command(&test_unit_ready(tag)).unwrap();
        assert_eq!(csw.tag, tag);
        assert_eq!(csw.status, CswStatus::Good);
    }
}

// ============================================================================
// Link Loss
// ============================================================================

#[test]
fn test_reconnect_after_link_loss() {
    let mut rig = TestRig::high_speed(64, BLOCK);
    let mut host = rig.start_and_connect();
    assert_good(&host.command(&test_unit_ready(1)).unwrap(), 1);

    // Worker is blocked on the next CBW; pulling the cable cancels it.
    assert!(host.has_pending_out(Duration::from_secs(1)));
    host.disconnect();
    assert!(rig.gadget.is_active());

    host.connect().unwrap();
    assert_good(&host.command(&test_unit_ready(2)).unwrap(), 2);
    let (data, csw) = host.command_in(&read10(3, 1, 1, BLOCK), 512).unwrap();
    assert_good(&csw, 3);
    assert_eq!(data, rig.contents()[512..1024].to_vec());
}

#[test]
fn test_reconnect_during_read_data_phase() {
    let mut rig = TestRig::high_speed(256, BLOCK);
    let mut host = rig.start_and_connect();

    // 100 KiB read moves in several chunks; take the first and pull the cable.
    host.send_cbw(&read10(1, 0, 200, BLOCK)).unwrap();
    let first = host.receive_once(32 * 1024).unwrap();
    assert_eq!(first, rig.contents()[..32 * 1024].to_vec());
    host.disconnect();
    host.connect().unwrap();

    // Nothing from the interrupted command reaches the new connection.
    assert!(!host.has_pending_in(Duration::from_millis(100)));
    assert_good(&host.command(&test_unit_ready(2)).unwrap(), 2);
    let (data, csw) = host.command_in(&read10(3, 4, 2, BLOCK), 1024).unwrap();
    assert_good(&csw, 3);
    assert_eq!(data, rig.contents()[4 * 512..6 * 512].to_vec());
}

#[test]
fn test_reconnect_during_write_data_phase() {
    let mut rig = TestRig::high_speed(256, BLOCK);
    let mut host = rig.start_and_connect();
    let before = rig.contents();

    host.send_cbw(&write10(1, 0, 200, BLOCK)).unwrap();
    host.send(&pattern(7, 32 * 1024)).unwrap();
    host.disconnect();
    host.connect().unwrap();

    assert!(!host.has_pending_in(Duration::from_millis(100)));
    assert_good(&host.command(&test_unit_ready(2)).unwrap(), 2);
    // The partial chunk never reached the backing store.
    assert_eq!(rig.contents(), before);
    assert_eq!(rig.stats.writes(), 0);
}
