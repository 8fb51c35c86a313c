//! Extra vCPUs running calls in parallel with the main one.
//!
//! Each SMP vCPU is owned by one worker thread for its whole life; every
//! operation on it is a job sent over that worker's channel, so jobs for
//! one CPU run in submission order and a vCPU fd is only ever used from
//! its own thread.
//!
//! ```text
//!   Machine ──timed_smpcall──▶ Worker 1 (tinyvm-cpu1) ─┐
//!                         ├──▶ Worker 2 (tinyvm-cpu2) ─┼──▶ batch channel
//!                         └──▶ Worker n               ─┘    (index, result)
//!   Machine ──smp_wait / gather_return_values ◀──────────────────┘
//! ```
//!
//! Results are kept per CPU: one CPU faulting does not hide the return
//! values of the others.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::cpu::ist_address;
use crate::machine::{init_vcpu, ticks_for, Machine, MachineError};
use crate::memory::MAX_SMP_CPUS;
use crate::vcpu::VirtualCpu;

/// Work executed on an SMP worker's vCPU.
pub type Job = Box<dyn FnOnce(&mut VirtualCpu) + Send>;

struct Worker {
    cpu_id: u32,
    jobs: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(mut cpu: VirtualCpu) -> Result<Self, MachineError> {
        let cpu_id = cpu.cpu_id();
        let (jobs, queue) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name(format!("tinyvm-cpu{cpu_id}"))
            .spawn(move || {
                for job in queue {
                    job(&mut cpu);
                }
                debug!("SMP worker for CPU {cpu_id} finished");
            })
            .map_err(|source| MachineError::SmpSpawn { cpu: cpu_id, source })?;
        Ok(Self {
            cpu_id,
            jobs: Some(jobs),
            thread: Some(thread),
        })
    }

    fn submit(&self, job: Job) -> Result<(), MachineError> {
        self.jobs
            .as_ref()
            .ok_or(MachineError::SmpWorker { cpu: self.cpu_id })?
            .send(job)
            .map_err(|_| MachineError::SmpWorker { cpu: self.cpu_id })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("SMP worker for CPU {} panicked", self.cpu_id);
            }
        }
    }
}

/// Calls in flight: results arrive on `done` tagged with the worker index.
struct Batch {
    done: Receiver<(usize, Result<u64, MachineError>)>,
    cpus: usize,
}

/// The SMP vCPUs of one machine.
pub struct Smp {
    workers: Vec<Worker>,
    batch: Option<Batch>,
    results: Vec<Option<Result<u64, MachineError>>>,
}

impl std::fmt::Debug for Smp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Smp")
            .field("cpus", &self.workers.len())
            .field("busy", &self.batch.is_some())
            .finish()
    }
}

impl Smp {
    fn new() -> Self {
        Self {
            workers: Vec::new(),
            batch: None,
            results: Vec::new(),
        }
    }

    pub fn cpus(&self) -> usize {
        self.workers.len()
    }

    /// Run `job` on worker `index` after the jobs already queued for it.
    pub fn submit(&self, index: usize, job: Job) -> Result<(), MachineError> {
        let worker = self.workers.get(index).ok_or(MachineError::SmpTooManyCpus {
            requested: index + 1,
            max: self.workers.len(),
        })?;
        worker.submit(job)
    }

    /// Start the same call on the first `cpus` workers; `frame(i)` gives
    /// worker `i` its stack pointer and arguments.
    fn start_calls<F>(&mut self, cpus: usize, addr: u64, ticks: u32, frame: F) -> Result<(), MachineError>
    where
        F: Fn(usize) -> (u64, Vec<u64>),
    {
        self.wait();
        self.results = (0..self.workers.len()).map(|_| None).collect();
        let (tx, done) = mpsc::channel();

        for index in 0..cpus {
            let (rsp, args) = frame(index);
            let tx = tx.clone();
            let job: Job = Box::new(move |cpu: &mut VirtualCpu| {
                let result = cpu
                    .setup_call(addr, rsp, &args)
                    .and_then(|()| cpu.run(ticks))
                    .and_then(|()| Ok(cpu.registers()?.rdi));
                // The receiver only goes away with the whole Smp.
                let _ = tx.send((index, result));
            });
            if let Err(e) = self.workers[index].submit(job) {
                self.results[index] = Some(Err(e));
            }
        }
        self.batch = Some(Batch { done, cpus });
        Ok(())
    }

    /// Block until every call of the current batch has finished.
    pub fn wait(&mut self) {
        let Some(batch) = self.batch.take() else {
            return;
        };
        let pending = (0..batch.cpus).filter(|&i| self.results[i].is_none()).count();
        for _ in 0..pending {
            match batch.done.recv() {
                Ok((index, result)) => self.results[index] = Some(result),
                Err(_) => break,
            }
        }
        for index in 0..batch.cpus {
            if self.results[index].is_none() {
                self.results[index] = Some(Err(MachineError::SmpWorker {
                    cpu: self.workers[index].cpu_id,
                }));
            }
        }
    }

    /// Per-CPU results of the last batch, in CPU order.
    pub fn take_results(&mut self) -> Vec<Result<u64, MachineError>> {
        self.wait();
        std::mem::take(&mut self.results).into_iter().flatten().collect()
    }
}

impl Machine {
    /// Make sure at least `cpus` SMP vCPUs exist.
    fn ensure_smp(&mut self, cpus: usize) -> Result<&mut Smp, MachineError> {
        if cpus > MAX_SMP_CPUS {
            return Err(MachineError::SmpTooManyCpus {
                requested: cpus,
                max: MAX_SMP_CPUS,
            });
        }
        let smp = self.smp.get_or_insert_with(Smp::new);
        while smp.workers.len() < cpus {
            let cpu_id = smp.workers.len() as u32 + 1;
            if self.memory.uses_cow() {
                let ist = ist_address(self.memory.physbase(), cpu_id);
                self.memory.allocate_page_for_write(ist, 0, true)?;
            }
            let cpu = init_vcpu(&self.vm, cpu_id, &self.memory, &self.runtime, &self.cpuid, &self.features)?;
            smp.workers.push(Worker::spawn(cpu)?);
            debug!("SMP vCPU {cpu_id} online");
        }
        Ok(smp)
    }

    /// Number of SMP vCPUs created so far.
    pub fn smp_cpus(&self) -> usize {
        self.smp.as_ref().map_or(0, Smp::cpus)
    }

    /// Call `addr` with the same `args` on `cpus` SMP vCPUs.  CPU `i`
    /// (0-based) gets the stack `[stack_base + i * stack_size,
    /// stack_base + (i + 1) * stack_size)`.  Returns without waiting.
    pub fn timed_smpcall(
        &mut self,
        cpus: usize,
        stack_base: u64,
        stack_size: u64,
        addr: u64,
        timeout: Duration,
        args: &[u64],
    ) -> Result<(), MachineError> {
        let ticks = ticks_for(timeout);
        let args = args.to_vec();
        self.ensure_smp(cpus)?.start_calls(cpus, addr, ticks, |i| {
            (stack_base + (i as u64 + 1) * stack_size, args.clone())
        })
    }

    /// Call `addr` on `cpus` SMP vCPUs with `rdi` = CPU index and
    /// `rsi` = `array + index * item_size`.  Returns without waiting.
    #[allow(clippy::too_many_arguments)]
    pub fn timed_smpcall_array(
        &mut self,
        cpus: usize,
        stack_base: u64,
        stack_size: u64,
        addr: u64,
        timeout: Duration,
        array: u64,
        item_size: u64,
    ) -> Result<(), MachineError> {
        let ticks = ticks_for(timeout);
        self.ensure_smp(cpus)?.start_calls(cpus, addr, ticks, |i| {
            let i = i as u64;
            (stack_base + (i + 1) * stack_size, vec![i, array + i * item_size])
        })
    }

    /// Block until the running SMP calls have finished.
    pub fn smp_wait(&mut self) {
        if let Some(smp) = self.smp.as_mut() {
            smp.wait();
        }
    }

    /// Wait for the last SMP calls and return each CPU's result.
    pub fn gather_return_values(&mut self) -> Vec<Result<u64, MachineError>> {
        self.smp.as_mut().map(Smp::take_results).unwrap_or_default()
    }

    /// Run `job` on SMP vCPU `index` (0-based), creating vCPUs as needed.
    pub fn smp_submit(&mut self, index: usize, job: Job) -> Result<(), MachineError> {
        self.ensure_smp(index + 1)?.submit(index, job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_smp_has_no_results() {
        let mut smp = Smp::new();
        assert_eq!(smp.cpus(), 0);
        smp.wait();
        assert!(smp.take_results().is_empty());
        assert!(matches!(
            smp.submit(0, Box::new(|_: &mut VirtualCpu| {})),
            Err(MachineError::SmpTooManyCpus { requested: 1, max: 0 })
        ));
    }

    #[test]
    fn smp_cpu_limit_fits_the_vsyscall_table() {
        assert!(MAX_SMP_CPUS >= 1);
        assert_eq!(ist_address(0, 1), crate::memory::SMP_IST_ADDR);
    }
}
