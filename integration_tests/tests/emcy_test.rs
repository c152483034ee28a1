//! EMCY emission against a full node

use std::time::Duration;

use cantata_common::datatypes::Value;
use integration_tests::TestBench;

#[test]
fn test_error_event_frame() {
    let bench = TestBench::new(2);

    bench.node.emcy().set(0x8210, 0x81, &[0xDE, 0xAD]).unwrap();
    let msg = bench.network.take_single_sent();
    assert_eq!(0x082, msg.cob_id);
    assert_eq!(&[0x10, 0x82, 0x81, 0xDE, 0xAD, 0x00, 0x00, 0x00], msg.data());

    // The error register is readable through SDO
    bench.expect_reply(
        0x602,
        &[0x40, 0x01, 0x10, 0x00, 0, 0, 0, 0],
        0x582,
        &[0x4F, 0x01, 0x10, 0x00, 0x81, 0x00, 0x00, 0x00],
    );
}

#[test]
fn test_inhibit_configured_via_sdo() {
    let bench = TestBench::new(2);

    // 0x1015 = 500 * 100 us = 50 ms
    bench.expect_reply(
        0x602,
        &[0x2B, 0x15, 0x10, 0x00, 0xF4, 0x01, 0x00, 0x00],
        0x582,
        &[0x60, 0x15, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00],
    );

    bench.node.emcy().set(0x1000, 1, &[]).unwrap();
    assert_eq!(1, bench.network.take_sent().len());

    // Two more inside the window: only the latest survives
    bench.node.emcy().set(0x2000, 2, &[]).unwrap();
    bench.node.emcy().set(0x3000, 3, &[]).unwrap();
    assert!(bench.network.take_sent().is_empty());

    bench.scheduler.run(Duration::from_millis(50));
    let msg = bench.network.take_single_sent();
    assert_eq!(&[0x00, 0x30, 0x03, 0, 0, 0, 0, 0], msg.data());
}

#[test]
fn test_disable_via_cob_id_bit() {
    let bench = TestBench::new(2);

    bench.expect_reply(
        0x602,
        &[0x23, 0x14, 0x10, 0x00, 0x82, 0x00, 0x00, 0x80],
        0x582,
        &[0x60, 0x14, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00],
    );
    assert!(!bench.node.emcy().enabled());

    bench.node.emcy().set(0x1000, 1, &[]).unwrap();
    assert!(bench.network.take_sent().is_empty());
    // The register write still happened
    assert_eq!(
        Value::Unsigned8(1),
        bench.node.od().read(0x1001, 0).unwrap()
    );
}
