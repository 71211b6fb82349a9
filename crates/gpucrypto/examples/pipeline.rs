//! Stream Pipeline Example
//!
//! Overlaps upload, kernel and download phases for several independent
//! requests, one request per dedicated stream, on the emulated backend.
//!
//! Run with `RUST_LOG=gpucrypto_core=debug cargo run --example pipeline`.

use std::thread;
use std::time::Duration;

use gpucrypto::prelude::*;
use tracing_subscriber::EnvFilter;

const STREAMS: usize = 4;
const BLOCKS: usize = 64;
const CHUNK: usize = 4096;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = DeviceConfig::builder()
        .with_streams(STREAMS)
        .with_capacity_per_stream(CHUNK)
        .build()?;
    let backend = CpuBackend::new();
    let mut ctx = DeviceContext::from_config(backend.clone(), &config)?;

    println!(
        "Device context: {} streams on '{}', {} bytes each\n",
        ctx.stream_count(),
        backend.name(),
        ctx.capacity_per_stream()
    );

    // Upload: each request's plaintext lands in its stream's device buffer.
    for (n, stream) in ctx.streams_mut().skip(1).enumerate() {
        stream.set_state(StreamState::WaitCopy);
        let copy = stream.handle().begin_op();
        let chunk = vec![n as u8; CHUNK];
        stream.buffer_mut().copy_from_host(0, &chunk)?;
        copy.complete();
    }
    ctx.sync_all(true)?;

    // Kernel: launched on every stream before any of them is waited on.
    let mut kernels = Vec::with_capacity(STREAMS);
    for id in ctx.stream_ids().skip(1).collect::<Vec<_>>() {
        ctx.set_state(id, StreamState::WaitKernel)?;
        ctx.clear_checkbits(id, BLOCKS)?;
        let delay = Duration::from_micros(20 * id.index() as u64);
        kernels.push(backend.spawn_kernel(
            ctx.get_stream(id)?,
            ctx.get_device_checkbits(id)?,
            BLOCKS,
            move |_| thread::sleep(delay),
        )?);
    }

    while !ctx.sync_all(false)? {
        let pending: Vec<_> = ctx
            .streams()
            .filter(|s| !s.is_idle())
            .map(|s| format!("{}:{}/{}", s.id(), s.checkbits().count_set(), s.num_blocks()))
            .collect();
        println!("  in flight: {}", pending.join(" "));
        thread::sleep(Duration::from_millis(1));
    }
    for kernel in kernels {
        kernel
            .join()
            .map_err(|_| anyhow::anyhow!("kernel thread panicked"))?;
    }

    for id in ctx.stream_ids().skip(1) {
        println!("stream {} kernel took {}us", id, ctx.get_elapsed_time(id)?);
    }

    // Download.
    for stream in ctx.streams_mut().skip(1) {
        stream.set_state(StreamState::WaitCopy);
        let copy = stream.handle().begin_op();
        let mut out = vec![0u8; 16];
        stream.buffer().copy_to_host(0, &mut out)?;
        copy.complete();
        stream.sync(true)?;
    }

    println!("\n{}", ctx.stats());
    ctx.teardown()?;
    Ok(())
}
