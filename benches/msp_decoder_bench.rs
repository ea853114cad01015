/*
Decoder throughput on a realistic proxy stream: RC and ANALOG replies
interleaved, fed in chunks the way a serial read hands them over.
The "corrupted" case flips one byte per frame so every frame goes
through the resync path.
*/

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::{hint::black_box, sync::Arc};

use sitl_bridge::fc::VirtualReceiver;
use sitl_bridge::msp::{Direction, MspDecoder, MspProxy, command, encode_v1, encode_v2};

//frames per generated stream
const FRAMES: usize = 256;

//serial read sizes to compare
const CHUNK_SIZES: &[usize] = &[1, 16, 64, 512];

fn stream(corrupt: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..FRAMES {
        let mut frame = if i % 2 == 0 {
            let rc: Vec<u8> = (0..16u16)
                .flat_map(|ch| (1000 + ch * 50 + i as u16 % 7).to_le_bytes())
                .collect();
            encode_v1(Direction::FromDevice, command::RC as u8, &rc).unwrap()
        } else {
            let mut analog = [0u8; 9];
            analog[3..5].copy_from_slice(&(700 + i as u16).to_le_bytes());
            encode_v2(Direction::FromDevice, 0, command::ANALOG, &analog).unwrap()
        };
        if corrupt {
            let last = frame.len() - 1;
            frame[last] ^= 0x5A;
        }
        out.extend_from_slice(&frame);
    }
    out
}

fn bench_decoder(c: &mut Criterion) {
    let mut group = c.benchmark_group("msp_decode");

    for corrupt in [false, true] {
        let data = stream(corrupt);
        group.throughput(Throughput::Bytes(data.len() as u64));

        for &chunk in CHUNK_SIZES {
            let label = if corrupt { "corrupted" } else { "clean" };
            group.bench_with_input(BenchmarkId::new(label, chunk), &chunk, |b, &chunk| {
                let mut decoder = MspDecoder::new();
                b.iter(|| {
                    let mut frames = 0;
                    for part in data.chunks(chunk) {
                        frames += decoder.decode(black_box(part)).len();
                    }
                    black_box(frames)
                });
            });
        }
    }
    group.finish();
}

fn bench_proxy_dispatch(c: &mut Criterion) {
    let data = stream(false);
    let receiver = Arc::new(VirtualReceiver::new());
    let mut proxy = MspProxy::new(receiver, true);

    let mut group = c.benchmark_group("msp_proxy");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("process_stream", |b| {
        b.iter(|| black_box(proxy.process(black_box(&data))));
    });
    group.finish();
}

criterion_group!(benches, bench_decoder, bench_proxy_dispatch);
criterion_main!(benches);
