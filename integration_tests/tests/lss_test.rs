//! LSS pre-assignment flows against a full node

use cantata_common::lss::LssMode;
use cantata_common::NodeId;
use integration_tests::TestBench;

#[test]
fn test_assign_node_id_to_unconfigured_node() {
    let bench = TestBench::new_unconfigured();
    // An unconfigured node announces nothing and serves no SDO channel
    assert_eq!(NodeId::Unconfigured, bench.node.node_id());
    assert_eq!(None, bench.node.sdo_server(0).cob_rx());

    // Switch every responder into configuration mode
    bench.expect_silence(0x7E5, &[0x04, 0x01, 0, 0, 0, 0, 0, 0]);
    assert_eq!(LssMode::Configuration, bench.node.lss().mode());

    // Assign node id 1
    bench.expect_reply(
        0x7E5,
        &[0x11, 0x01, 0, 0, 0, 0, 0, 0],
        0x7E4,
        &[0x11, 0x00, 0, 0, 0, 0, 0, 0],
    );
    // Not live yet
    assert_eq!(NodeId::Unconfigured, bench.node.node_id());

    // Switching back to waiting resets the node, which now boots with its
    // new identity
    bench.expect_reply(0x7E5, &[0x04, 0x00, 0, 0, 0, 0, 0, 0], 0x701, &[0x00]);
    assert_eq!(1, bench.node.node_id().raw());
    assert_eq!(LssMode::Waiting, bench.node.lss().mode());

    // The SDO channel followed the node id
    assert_eq!(Some(0x601), bench.node.sdo_server(0).cob_rx());
    bench.expect_reply(
        0x601,
        &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0],
        0x581,
        &[0x43, 0x00, 0x10, 0x00, 0, 0, 0, 0],
    );
}

#[test]
fn test_selective_switch_against_identity() {
    let bench = TestBench::new(2);
    for (sub, value) in [(1u8, 0xCAFEu32), (2, 1032), (3, 2), (4, 77)] {
        bench
            .node
            .od()
            .write(0x1018, sub, cantata_common::datatypes::Value::Unsigned32(value), false)
            .unwrap();
    }

    let fields = [0xCAFEu32, 1032, 2, 77];
    for (i, value) in fields.iter().enumerate() {
        let mut frame = [0u8; 8];
        frame[0] = 0x40 + i as u8;
        frame[1..5].copy_from_slice(&value.to_le_bytes());
        if i < 3 {
            bench.expect_silence(0x7E5, &frame);
        } else {
            bench.expect_reply(0x7E5, &frame, 0x7E4, &[0x44, 0, 0, 0, 0, 0, 0, 0]);
        }
    }
    assert_eq!(LssMode::Configuration, bench.node.lss().mode());

    // An NMT reset drops the responder back to waiting
    bench.network.receive(0x000, &[0x81, 0x02]);
    bench.network.take_sent();
    assert_eq!(LssMode::Waiting, bench.node.lss().mode());
}

#[test]
fn test_selective_switch_mismatch_stays_waiting() {
    let bench = TestBench::new(2);

    for (i, value) in [1u32, 2, 3, 4].iter().enumerate() {
        let mut frame = [0u8; 8];
        frame[0] = 0x40 + i as u8;
        frame[1..5].copy_from_slice(&value.to_le_bytes());
        bench.expect_silence(0x7E5, &frame);
    }
    assert_eq!(LssMode::Waiting, bench.node.lss().mode());

    // Configuration commands are ignored while waiting
    bench.expect_silence(0x7E5, &[0x11, 0x05, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn test_identify_non_configured() {
    let bench = TestBench::new_unconfigured();
    bench.expect_reply(
        0x7E5,
        &[0x4C, 0, 0, 0, 0, 0, 0, 0],
        0x7E4,
        &[0x50, 0, 0, 0, 0, 0, 0, 0],
    );

    let configured = TestBench::new(2);
    configured.expect_silence(0x7E5, &[0x4C, 0, 0, 0, 0, 0, 0, 0]);
}
