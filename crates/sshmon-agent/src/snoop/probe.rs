//! Kernel-side capture: eBPF program load, attach, and per-CPU readers
//!
//! The compiled object is loaded from disk at runtime, the execve
//! tracepoint attached, and one reader task spawned per online CPU. All
//! readers forward decoded records into a single channel so that exactly
//! one consumer performs reassembly.

use std::mem;
use std::path::Path;

use aya::maps::perf::AsyncPerfEventArray;
use aya::programs::TracePoint;
use aya::util::online_cpus;
use aya::Ebpf;
use bytes::BytesMut;
use sshmon_common::TraceRecord;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::SnoopError;

/// Program name inside the object file.
const EXECVE_PROG: &str = "sshmon_execve";
/// Perf event array map name inside the object file.
const EVENTS_MAP: &str = "EVENTS";
/// Records read per wakeup on each per-CPU buffer.
const READ_BATCH: usize = 64;

/// A loaded and attached execve tracer. Dropping it detaches the
/// tracepoint and releases the perf buffers.
pub(crate) struct ExecProbe {
    // Held for its Drop: detaches the program and frees kernel resources.
    _ebpf: Ebpf,
    readers: Vec<JoinHandle<()>>,
}

impl ExecProbe {
    /// Load the object, attach `syscalls:sys_enter_execve`, and start the
    /// per-CPU readers. Every failure here is fatal to the capture engine;
    /// there is no degraded mode without the probe.
    pub(crate) fn start(
        object: &Path,
        record_tx: mpsc::Sender<TraceRecord>,
        cancel: CancellationToken,
    ) -> Result<Self, SnoopError> {
        bump_memlock_rlimit();

        let bytecode = std::fs::read(object)
            .map_err(|e| SnoopError::Load(format!("reading {}: {}", object.display(), e)))?;
        let mut ebpf = Ebpf::load(&bytecode).map_err(|e| SnoopError::Load(e.to_string()))?;

        let program: &mut TracePoint = ebpf
            .program_mut(EXECVE_PROG)
            .ok_or_else(|| SnoopError::Load(format!("program {} not in object", EXECVE_PROG)))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| SnoopError::Load(e.to_string()))?;
        program
            .load()
            .map_err(|e| SnoopError::Load(e.to_string()))?;
        program
            .attach("syscalls", "sys_enter_execve")
            .map_err(|e| SnoopError::Attach(e.to_string()))?;

        let mut perf = AsyncPerfEventArray::try_from(
            ebpf.take_map(EVENTS_MAP)
                .ok_or_else(|| SnoopError::PerfBuffer(format!("map {} not in object", EVENTS_MAP)))?,
        )
        .map_err(|e| SnoopError::PerfBuffer(e.to_string()))?;

        let cpus = online_cpus().map_err(|e| SnoopError::PerfBuffer(format!("{:?}", e)))?;
        let mut readers = Vec::with_capacity(cpus.len());
        for cpu_id in cpus {
            let buf = perf
                .open(cpu_id, None)
                .map_err(|e| SnoopError::PerfBuffer(e.to_string()))?;
            readers.push(tokio::spawn(read_loop(
                cpu_id,
                buf,
                record_tx.clone(),
                cancel.clone(),
            )));
        }

        Ok(Self {
            _ebpf: ebpf,
            readers,
        })
    }

    /// Wait for the readers to wind down (they exit once `cancel` fires),
    /// then detach. The caller bounds this wait.
    pub(crate) async fn stop(self) {
        for reader in self.readers {
            let _ = reader.await;
        }
    }
}

async fn read_loop(
    cpu_id: u32,
    mut buf: aya::maps::perf::AsyncPerfEventArrayBuffer<aya::maps::MapData>,
    record_tx: mpsc::Sender<TraceRecord>,
    cancel: CancellationToken,
) {
    let mut buffers = (0..READ_BATCH)
        .map(|_| BytesMut::with_capacity(mem::size_of::<TraceRecord>()))
        .collect::<Vec<_>>();

    loop {
        let events = tokio::select! {
            result = buf.read_events(&mut buffers) => match result {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to read perf buffer on CPU {}: {}", cpu_id, e);
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        };

        if events.lost > 0 {
            warn!("Kernel dropped {} trace records on CPU {}", events.lost, cpu_id);
        }
        for chunk in buffers.iter().take(events.read) {
            let Some(record) = decode_record(chunk) else {
                continue;
            };
            if record_tx.send(record).await.is_err() {
                // reassembly consumer is gone
                return;
            }
        }
    }
    debug!("Perf reader for CPU {} stopped", cpu_id);
}

/// Decode one raw perf payload into a [`TraceRecord`]. Malformed payloads
/// are logged and dropped without touching any reassembly state.
pub(crate) fn decode_record(data: &[u8]) -> Option<TraceRecord> {
    if data.len() < mem::size_of::<TraceRecord>() {
        warn!(
            "Malformed trace record: {} bytes, expected {}",
            data.len(),
            mem::size_of::<TraceRecord>()
        );
        return None;
    }
    // Pod layout; perf payloads carry no alignment guarantee.
    Some(unsafe { std::ptr::read_unaligned(data.as_ptr().cast::<TraceRecord>()) })
}

/// Raise RLIMIT_MEMLOCK so map creation does not fail on older kernels.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("Failed to raise memlock rlimit (continuing without it)");
    }
}
