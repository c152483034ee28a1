//! EDS generation served through SDO

use cantata_eds::Eds;
use integration_tests::TestBench;

/// Pull a complete segmented upload of (index, sub) through the SDO
/// channel and return the reassembled bytes
fn sdo_upload(bench: &TestBench, index: u16, sub: u8) -> Vec<u8> {
    let mut init = [0u8; 8];
    init[0] = 0x40;
    init[1..3].copy_from_slice(&index.to_le_bytes());
    init[3] = sub;
    let reply = bench.exchange(0x602, &init);
    assert_eq!(1, reply.len());
    let header = reply[0].data();
    assert_eq!(0x41, header[0] & 0xF1, "expected a sized segmented response");
    let size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;

    let mut collected = Vec::new();
    let mut toggle = false;
    loop {
        let mut request = [0u8; 8];
        request[0] = 0x60 | ((toggle as u8) << 4);
        let reply = bench.exchange(0x602, &request);
        assert_eq!(1, reply.len());
        let data = reply[0].data();
        assert_eq!((toggle as u8) << 4, data[0] & 0x10);
        let unused = ((data[0] >> 1) & 0x07) as usize;
        collected.extend_from_slice(&data[1..8 - unused]);
        if data[0] & 0x01 != 0 {
            break;
        }
        toggle = !toggle;
    }
    assert_eq!(size, collected.len());
    collected
}

#[test]
fn test_eds_served_as_domain_0x1021() {
    let bench = TestBench::new(2);
    let mut eds = Eds::new();
    eds.device_info.vendor_name = Some("cantata works".into());
    eds.install(&bench.node).unwrap();

    let bytes = sdo_upload(&bench, 0x1021, 0);
    let text = String::from_utf8(bytes).unwrap();

    assert!(text.contains("[FileInfo]"));
    assert!(text.contains("VendorName=cantata works"));
    assert!(text.contains("[MandatoryObjects]"));
    assert!(text.contains("DefaultValue=$NodeID+0x600"));

    // The document tracks the live dictionary
    bench
        .node
        .od()
        .write(
            0x1017,
            0,
            cantata_common::datatypes::Value::Unsigned16(250),
            false,
        )
        .unwrap();
    bench.network.take_sent();
    let text = String::from_utf8(sdo_upload(&bench, 0x1021, 0)).unwrap();
    let heartbeat = text.split("[1017]").nth(1).unwrap();
    assert!(heartbeat.contains("DefaultValue=250"));
}
