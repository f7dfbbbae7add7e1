//! Bulk channel access across a two-module chain

use pretty_assertions::assert_eq;
use qontrol_protocol::{
    AddressingMode, BinaryCommand, ChannelMap, HeaderFlags, QontrolError, Qontroller, SessionConfig,
    VirtualDevice,
};

fn two_module_chain() -> VirtualDevice {
    VirtualDevice::new()
        .respond("nup=0", &["OK"])
        .respond("nupall?", &["Q4x-0001 : 0", "Q4x-0002 : 1"])
}

fn connect(device: &VirtualDevice) -> Qontroller {
    let config = SessionConfig {
        response_timeout_ms: 30,
        inter_response_timeout_ms: 10,
        ..SessionConfig::default()
    };
    let mut q = Qontroller::with_transport(device.clone(), config);
    q.discover_chain();
    q
}

/// Writes issued after chain discovery
fn commands_sent(device: &VirtualDevice) -> Vec<String> {
    device.written().into_iter().skip(2).collect()
}

#[test]
fn test_bulk_set_one_command_per_module() {
    let device = two_module_chain()
        .respond("vvec2=4.5,4.5", &["OK"])
        .respond("vvec4=4.5", &["OK"]);
    let mut q = connect(&device);
    assert_eq!(q.n_channels(), 8);

    q.set_channels("v", 2..5, 4.5).unwrap();

    assert_eq!(
        commands_sent(&device),
        vec!["vvec2=4.5,4.5\n".to_string(), "vvec4=4.5\n".to_string()]
    );
}

#[test]
fn test_bulk_set_per_channel_values() {
    let device = two_module_chain()
        .respond("ivec3=1.0", &["OK"])
        .respond("ivec4=2.0,3.5", &["OK"]);
    let mut q = connect(&device);

    q.set_channels("i", 3..6, vec![1.0, 2.0, 3.5]).unwrap();

    assert_eq!(
        commands_sent(&device),
        vec!["ivec3=1.0\n".to_string(), "ivec4=2.0,3.5\n".to_string()]
    );
}

#[test]
fn test_bulk_read_preserves_order() {
    let device = two_module_chain().respond(
        "vall?",
        &["0.0", "0.5", "4.5", "4.25", "-1.0", "2.0", "0.0", "0.0"],
    );
    let mut q = connect(&device);

    let values = q.get_channels("v", 2..5).unwrap();

    assert_eq!(values, vec![4.5, 4.25, -1.0]);
    assert_eq!(commands_sent(&device), vec!["vall?\n".to_string()]);
}

#[test]
fn test_read_whole_chain() {
    let device = two_module_chain().respond(
        "iall?",
        &["1.0", "2.0", "3.0", "4.0", "5.0", "6.0", "7.0", "+8.0"],
    );
    let mut q = connect(&device);

    let values = q.get_all_channels("i").unwrap();
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
}

#[test]
fn test_short_bulk_read_times_out() {
    let device = two_module_chain().respond("vall?", &["1.0", "2.0", "3.0"]);
    let mut q = connect(&device);

    assert!(matches!(
        q.get_channels("v", 0..2),
        Err(QontrolError::Timeout(_))
    ));
}

#[test]
fn test_binary_bulk_read_per_module() {
    let module_read = |device_id| {
        BinaryCommand::new(0x00)
            .read()
            .flags(HeaderFlags::ALLCH)
            .addressing(AddressingMode::DeviceWise { device_id })
            .encode()
            .unwrap()
    };
    let device = two_module_chain()
        .respond_bytes(&module_read(0), &["0.0", "0.1", "4.5", "4.25"])
        .respond_bytes(&module_read(1), &["-1.0", "2.0", "0.0", "0.0"]);
    let mut q = connect(&device);

    let values = q.get_channels_binary(0x00, 2..6).unwrap();

    assert_eq!(values, vec![4.5, 4.25, -1.0, 2.0]);
    let frames: Vec<Vec<u8>> = device.written_frames().into_iter().skip(2).collect();
    assert_eq!(frames, vec![module_read(0), module_read(1)]);
}

#[test]
fn test_length_mismatch_sends_nothing() {
    let device = two_module_chain();
    let mut q = connect(&device);

    let err = q.set_channels("v", 0..3, vec![1.0, 2.0]).unwrap_err();
    assert!(matches!(err, QontrolError::InvalidValue(_)));
    assert!(commands_sent(&device).is_empty());
}

#[test]
fn test_range_beyond_chain() {
    let device = two_module_chain();
    let mut q = connect(&device);

    assert!(matches!(
        q.set_channels("v", 6..9, 1.0),
        Err(QontrolError::InvalidChannel { channel: 8, max: 7 })
    ));
    assert!(matches!(
        q.get_channels("v", 0..9),
        Err(QontrolError::InvalidChannel { .. })
    ));
}

#[test]
fn test_manual_channel_map() {
    let device = VirtualDevice::new()
        .respond("vvec0=1.0,1.0", &["OK"])
        .respond("vvec2=1.0", &["OK"]);
    let config = SessionConfig {
        response_timeout_ms: 30,
        inter_response_timeout_ms: 10,
        ..SessionConfig::default()
    };
    let mut q = Qontroller::with_transport(device.clone(), config);
    q.set_channel_map(ChannelMap::from_counts([2, 2]));

    q.set_channels("v", 0..3, 1.0).unwrap();
    assert_eq!(device.written().len(), 2);
}

#[test]
fn test_binary_bulk_set() {
    let first = BinaryCommand::new(0x00)
        .flags(HeaderFlags::DEXT)
        .channel(2)
        .values(vec![100, 200]);
    let second = BinaryCommand::new(0x00)
        .flags(HeaderFlags::DEXT)
        .channel(4)
        .values(vec![300]);
    let device = two_module_chain()
        .respond_bytes(&first.encode().unwrap(), &["OK"])
        .respond_bytes(&second.encode().unwrap(), &["OK"]);
    let mut q = connect(&device);

    q.set_channels_binary(0x00, 2..5, vec![100, 200, 300]).unwrap();

    let frames: Vec<Vec<u8>> = device.written_frames().into_iter().skip(2).collect();
    assert_eq!(frames, vec![first.encode().unwrap(), second.encode().unwrap()]);
    assert!(frames.iter().all(|f| f[0] & 0x02 != 0));
}
