//! NMT lifecycle and heartbeat behavior

use std::time::Duration;

use cantata_common::messages::NmtState;
use integration_tests::TestBench;

#[test]
fn test_boot_up_is_first_frame() {
    use cantata_common::test_utils::MockNetwork;
    use cantata_common::NodeId;
    use cantata_node::{Node, VirtualScheduler};
    use std::sync::Arc;

    let network = MockNetwork::new();
    let scheduler = Arc::new(VirtualScheduler::new());
    let node = Node::new(network.clone(), scheduler, NodeId::new(2).unwrap());

    let sent = network.take_sent();
    assert!(!sent.is_empty());
    assert_eq!(0x702, sent[0].cob_id);
    assert_eq!(&[0x00], sent[0].data());
    assert_eq!(NmtState::PreOperational, node.nmt().state());
}

#[test]
fn test_state_commands() {
    let bench = TestBench::new(2);

    bench.network.receive(0x000, &[0x01, 0x02]);
    assert_eq!(NmtState::Operational, bench.node.nmt().state());

    bench.network.receive(0x000, &[0x02, 0x02]);
    assert_eq!(NmtState::Stopped, bench.node.nmt().state());

    bench.network.receive(0x000, &[0x80, 0x02]);
    assert_eq!(NmtState::PreOperational, bench.node.nmt().state());

    // Broadcast works too
    bench.network.receive(0x000, &[0x01, 0x00]);
    assert_eq!(NmtState::Operational, bench.node.nmt().state());

    // Another node's command does not
    bench.network.receive(0x000, &[0x02, 0x03]);
    assert_eq!(NmtState::Operational, bench.node.nmt().state());
}

#[test]
fn test_reset_node_emits_boot_up() {
    let bench = TestBench::new(2);

    bench.network.receive(0x000, &[0x81, 0x02]);
    let sent = bench.network.take_sent();
    assert_eq!(0x702, sent[0].cob_id);
    assert_eq!(&[0x00], sent[0].data());
    assert_eq!(NmtState::PreOperational, bench.node.nmt().state());

    bench.network.receive(0x000, &[0x82, 0x02]);
    let sent = bench.network.take_sent();
    assert_eq!(0x702, sent[0].cob_id);
}

#[test]
fn test_heartbeat_producer() {
    let bench = TestBench::new(2);

    // Enable a 50 ms heartbeat through SDO; the enable emits once, before
    // the SDO acknowledge goes out
    let sent = bench.exchange(0x602, &[0x2B, 0x17, 0x10, 0x00, 0x32, 0x00, 0x00, 0x00]);
    assert_eq!(2, sent.len());
    assert_eq!(0x702, sent[0].cob_id);
    assert_eq!(&[127], sent[0].data());
    assert_eq!(0x582, sent[1].cob_id);
    assert_eq!(
        &[0x60, 0x17, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00],
        sent[1].data()
    );

    bench.scheduler.run(Duration::from_millis(200));
    let sent = bench.network.take_sent();
    assert_eq!(4, sent.len());
    assert!(sent.iter().all(|m| m.cob_id == 0x702 && m.data() == [127]));

    // Heartbeat reflects the NMT state
    bench.node.nmt().set_state(NmtState::Operational);
    bench.network.take_sent();
    bench.scheduler.run(Duration::from_millis(50));
    assert_eq!(&[5], bench.network.take_single_sent().data());

    // Writing zero stops emission
    bench.expect_reply(
        0x602,
        &[0x2B, 0x17, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00],
        0x582,
        &[0x60, 0x17, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00],
    );
    bench.scheduler.run(Duration::from_millis(500));
    assert!(bench.network.take_sent().is_empty());
}
