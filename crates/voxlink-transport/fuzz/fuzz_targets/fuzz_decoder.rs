#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use voxlink_transport::config::TransportConfig;
use voxlink_transport::crypto::PacketCipher;
use voxlink_transport::decoder::{DecodeHandler, PacketDecoder};
use voxlink_transport::reorder::ReassembledCommand;
use voxlink_transport::statistics::PacketStatistics;
use voxlink_transport::wire::{Datagram, Origin, PacketType};

struct Discard<'a>(&'a PacketDecoder);

impl DecodeHandler for Discard<'_> {
    fn decoded_command(&mut self, _packet_type: PacketType, command: ReassembledCommand) {
        self.0.recycle(command);
    }

    fn decoded_packet(&mut self, _datagram: &Datagram<'_>) {}

    fn send_acknowledge(&mut self, _wire_id: u16, _low_priority: bool) {}
}

/// Feed a stream of datagrams through one decoder.
///
/// The first byte selects the origin; the rest is split into datagrams on
/// a length prefix byte. Unencrypted datagrams reach reorder, reassembly and
/// decompression with attacker-chosen flags and ids. Nothing may panic.
fuzz_target!(|data: &[u8]| {
    let Some((&selector, mut rest)) = data.split_first() else {
        return;
    };
    let origin = if selector & 1 == 0 { Origin::Client } else { Origin::Server };

    let config = TransportConfig {
        reorder_capacity: 16,
        max_command_size: 1 << 20,
        ..TransportConfig::default()
    };
    let decoder = PacketDecoder::new(
        Arc::new(PacketCipher::new()),
        Arc::new(PacketStatistics::default()),
        &config,
    );
    let mut handler = Discard(&decoder);

    while let Some((&len, tail)) = rest.split_first() {
        let len = (len as usize).min(tail.len());
        let mut datagram = tail[..len].to_vec();
        rest = &tail[len..];

        if let Ok(mut dg) = Datagram::parse(&mut datagram, origin) {
            let _ = decoder.process_incoming_data(&mut dg, &mut handler);
        }
    }
});
