//! Per-datagram processing benchmarks for voxlink-transport.
//!
//! Measures the receive hot path:
//! - Header parsing
//! - EAX decryption with derived keys (cached per generation)
//! - Full decode of voice datagrams
//! - Command reassembly from fragments, with and without compression
//!
//! Run with: cargo bench --package voxlink-transport

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

use voxlink_transport::config::TransportConfig;
use voxlink_transport::crypto::PacketCipher;
use voxlink_transport::decoder::{DecodeHandler, PacketDecoder};
use voxlink_transport::encoder::PacketEncoder;
use voxlink_transport::reorder::ReassembledCommand;
use voxlink_transport::statistics::PacketStatistics;
use voxlink_transport::wire::{Datagram, Origin, PacketFlags, PacketType};

struct Sink<'a> {
    decoder: &'a PacketDecoder,
    bytes: usize,
}

impl DecodeHandler for Sink<'_> {
    fn decoded_command(&mut self, _packet_type: PacketType, command: ReassembledCommand) {
        self.bytes += command.len();
        self.decoder.recycle(command);
    }

    fn decoded_packet(&mut self, datagram: &Datagram<'_>) {
        self.bytes += datagram.payload().len();
    }

    fn send_acknowledge(&mut self, _wire_id: u16, _low_priority: bool) {}
}

/// Client-side encoder and server-side decoder sharing one session secret.
fn session(config: &TransportConfig) -> (PacketEncoder, PacketDecoder) {
    let iv = [0x42u8; 64];
    let client_cipher = Arc::new(PacketCipher::new());
    client_cipher.install_shared_iv(&iv).unwrap();
    let server_cipher = Arc::new(PacketCipher::new());
    server_cipher.install_shared_iv(&iv).unwrap();

    let encoder = PacketEncoder::new(
        Origin::Client,
        client_cipher,
        Arc::new(PacketStatistics::default()),
        config,
    );
    let decoder = PacketDecoder::new(server_cipher, Arc::new(PacketStatistics::default()), config);
    (encoder, decoder)
}

fn drain(encoder: &PacketEncoder) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| encoder.pop_write_buffer())
        .map(|d| d.to_vec())
        .collect()
}

// ─── Parsing ─────────────────────────────────────────────────────────────

fn bench_parse(c: &mut Criterion) {
    let (encoder, _decoder) = session(&TransportConfig::default());
    encoder
        .send_packet(PacketType::Voice, PacketFlags::NONE, &[0u8; 160])
        .unwrap();
    let raw = drain(&encoder).remove(0);

    c.bench_function("datagram_parse", |b| {
        let mut buf = raw.clone();
        b.iter(|| {
            let dg = Datagram::parse(black_box(&mut buf), Origin::Client).unwrap();
            black_box(dg.full_id());
        });
    });
}

// ─── Voice ───────────────────────────────────────────────────────────────

fn bench_voice_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("voice_decode");

    for size in [40usize, 160, 500] {
        let (encoder, decoder) = session(&TransportConfig::default());
        encoder
            .send_packet(PacketType::Voice, PacketFlags::NONE, &vec![0x5Au8; size])
            .unwrap();
        let raw = drain(&encoder).remove(0);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            let mut sink = Sink { decoder: &decoder, bytes: 0 };
            b.iter(|| {
                let mut buf = raw.clone();
                let mut dg = Datagram::parse(&mut buf, Origin::Client).unwrap();
                decoder.process_incoming_data(&mut dg, &mut sink).unwrap();
            });
            black_box(sink.bytes);
        });
    }
    group.finish();
}

// ─── Commands ────────────────────────────────────────────────────────────

fn bench_command_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_reassembly");

    let plain: Vec<u8> = (0..4000u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect();
    let text = b"notifycliententerview clid=7 cid=1 client_nickname=bench ".repeat(70);

    for (name, command, threshold) in [
        ("fragmented_4KB", plain, usize::MAX),
        ("compressed_4KB", text, 100),
    ] {
        let config = TransportConfig {
            compression_threshold: threshold,
            ..TransportConfig::default()
        };
        group.throughput(Throughput::Bytes(command.len() as u64));
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let (encoder, decoder) = session(&config);
                    encoder.send_command(&command, false, None).unwrap();
                    (drain(&encoder), decoder)
                },
                |(datagrams, decoder)| {
                    let mut sink = Sink { decoder: &decoder, bytes: 0 };
                    for mut raw in datagrams {
                        let mut dg = Datagram::parse(&mut raw, Origin::Client).unwrap();
                        decoder.process_incoming_data(&mut dg, &mut sink).unwrap();
                    }
                    black_box(sink.bytes)
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_parse,
    bench_voice_decode,
    bench_command_reassembly
);
criterion_main!(benches);
