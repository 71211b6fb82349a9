//! Hardware tests for the CUDA backend.
//!
//! Run with `cargo test -p gpucrypto-cuda --features cuda -- --ignored`.

#![cfg(feature = "cuda")]

use cudarc::driver::LaunchConfig;

use gpucrypto_core::prelude::*;
use gpucrypto_cuda::{compile_ptx, is_cuda_available, CudaBackend, CHECKBIT_SIGNAL_SOURCE};

const MARK_KERNEL: &str = r#"
extern "C" __global__ void mark_blocks(unsigned char* checkbits) {
    gpucrypto_signal_block(checkbits);
}
"#;

fn backend() -> Option<CudaBackend> {
    if !is_cuda_available() {
        eprintln!("CUDA not available, skipping");
        return None;
    }
    Some(CudaBackend::new(0).expect("open device 0"))
}

#[test]
#[ignore] // Requires CUDA hardware
fn test_init_and_teardown() {
    let Some(backend) = backend() else { return };

    let mut ctx = DeviceContext::init(backend, 1 << 20, 4).unwrap();
    assert_eq!(ctx.stream_count(), 4);
    assert!(ctx.get_stream(StreamId::Default).unwrap().is_default());
    assert!(!ctx.get_stream(StreamId::Dedicated(1)).unwrap().is_default());

    ctx.teardown().unwrap();
    assert!(ctx.is_released());
}

#[test]
#[ignore] // Requires CUDA hardware
fn test_kernel_checkbits_complete() {
    let Some(backend) = backend() else { return };

    let ptx = compile_ptx(&format!("{}{}", CHECKBIT_SIGNAL_SOURCE, MARK_KERNEL)).unwrap();
    let module = backend.inner().load_module(ptx).unwrap();
    let mark = module.load_function("mark_blocks").unwrap();

    let mut ctx = DeviceContext::init(backend, 1 << 20, 2).unwrap();
    let id = StreamId::Dedicated(2);
    let blocks = 512u32;

    ctx.set_state(id, StreamState::WaitKernel).unwrap();
    ctx.clear_checkbits(id, blocks as usize).unwrap();
    assert!(!ctx.sync(id, false).unwrap());

    let checkbits = ctx.get_device_checkbits(id).unwrap().as_kernel_arg();
    let stream = ctx.get_stream(id).unwrap().inner().clone();
    unsafe {
        stream
            .launch_builder(&mark)
            .arg(&checkbits)
            .launch(LaunchConfig {
                grid_dim: (blocks, 1, 1),
                block_dim: (128, 1, 1),
                shared_mem_bytes: 0,
            })
            .unwrap();
    }

    assert!(ctx.sync(id, true).unwrap());
    assert_eq!(ctx.get_state(id).unwrap(), StreamState::Ready);
    assert_eq!(ctx.checkbits(id).unwrap().count_set(), blocks as usize);
}

#[test]
#[ignore] // Requires CUDA hardware
fn test_idle_stream_copy_query_completes() {
    let Some(backend) = backend() else { return };

    let mut ctx = DeviceContext::init(backend, 4096, 1).unwrap();
    let id = StreamId::Dedicated(1);

    let stream = ctx.get_stream(id).unwrap().inner().clone();
    let host = vec![7u8; 4096];
    stream
        .memcpy_htod(&host, ctx.device_buffer_mut(id).unwrap().as_mut_slice())
        .unwrap();

    ctx.set_state(id, StreamState::WaitCopy).unwrap();
    assert!(ctx.sync(id, true).unwrap());
    assert_eq!(ctx.get_state(id).unwrap(), StreamState::Ready);
}

#[test]
#[ignore] // Requires CUDA hardware
fn test_checkbit_region_mapping() {
    let Some(backend) = backend() else { return };

    let region = backend.alloc_checkbits(MAX_BLOCKS).unwrap();
    assert_eq!(region.len(), MAX_BLOCKS);
    assert_ne!(region.device_ptr(), 0);
    assert!(region
        .host_bytes()
        .iter()
        .all(|b| b.load(std::sync::atomic::Ordering::Acquire) == 0));

    let err = backend.alloc_checkbits(0).unwrap_err();
    assert!(matches!(err, DeviceError::AllocationFailed { size: 0, .. }));
}
