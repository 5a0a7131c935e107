//! The automated scheduler: one task owns the job pool and the master
//! pool, and keeps auto-flagged masters saturated.
//!
//! All access goes through typed messages; there is no shared state. Every
//! recomputation tallies what is actually running right now, so a crashed
//! or finished job frees its slot on the next pass without bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::admin::job::Job;
use crate::admin::live_job::LiveJob;
use crate::admin::live_master::LiveMaster;
use crate::admin::notify::ChangeNotifier;
use crate::error::{Error, Result};

enum SchedMsg {
    SetJobs(Vec<Job>),
    AddMaster(Arc<LiveMaster>, bool),
    SetAuto(Arc<LiveMaster>, bool),
    Launch {
        master: Arc<LiveMaster>,
        job: Job,
        resp: oneshot::Sender<Result<Arc<LiveJob>>>,
    },
    GetJobs(oneshot::Sender<Vec<Job>>),
    GetMasters(oneshot::Sender<(Vec<Arc<LiveMaster>>, Vec<bool>)>),
}

/// Handle to the scheduler task. All jobs should be launched through it,
/// even manual ones, so the scheduler sees every running job when it
/// recomputes.
pub struct Scheduler {
    requests: mpsc::Sender<SchedMsg>,
    shutdown: CancellationToken,
    master_note: Arc<ChangeNotifier>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (req_tx, req_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let master_note = Arc::new(ChangeNotifier::new());
        tokio::spawn(run_loop(req_rx, shutdown.clone(), master_note.clone()));
        Self {
            requests: req_tx,
            shutdown,
            master_note,
        }
    }

    /// Begin shutdown: cancel every master and refuse new work. Masters
    /// may take a moment to finish dying.
    pub fn terminate(&self) {
        self.shutdown.cancel();
    }

    pub fn terminated(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// False once the scheduler has fully finished terminating.
    pub fn running(&self) -> bool {
        !self.master_note.closed()
    }

    /// Read-only copy of the current job pool.
    pub async fn jobs(&self) -> Result<Vec<Job>> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedMsg::GetJobs(tx)).await?;
        rx.await.map_err(|_| Error::SchedulerShutdown)
    }

    /// Replace the job pool. Running jobs keep their launch-time copies.
    pub async fn set_jobs(&self, jobs: Vec<Job>) -> Result<()> {
        self.send(SchedMsg::SetJobs(jobs)).await
    }

    /// All masters plus, for each, whether it is auto-scheduled.
    pub async fn masters(&self) -> Result<(Vec<Arc<LiveMaster>>, Vec<bool>)> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedMsg::GetMasters(tx)).await?;
        rx.await.map_err(|_| Error::SchedulerShutdown)
    }

    /// Add a connected master to the pool.
    pub async fn add_master(&self, master: Arc<LiveMaster>, auto: bool) -> Result<()> {
        self.send(SchedMsg::AddMaster(master, auto)).await
    }

    /// Flip a master's auto-scheduling flag. A no-op after termination.
    pub async fn set_auto(&self, master: &Arc<LiveMaster>, auto: bool) {
        let _ = self.send(SchedMsg::SetAuto(master.clone(), auto)).await;
    }

    /// Manually launch `job` on `master`, under the scheduler's watch.
    pub async fn launch(&self, master: &Arc<LiveMaster>, job: &Job) -> Result<Arc<LiveJob>> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedMsg::Launch {
            master: master.clone(),
            job: job.clone(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| Error::SchedulerShutdown)?
    }

    /// Wait for more masters to join; semantics as
    /// [`LiveMaster::wait_jobs`](crate::admin::LiveMaster::wait_jobs).
    pub async fn wait_masters(&self, last_seen: u64, cancel: Option<&CancellationToken>) -> bool {
        self.master_note.wait(last_seen, cancel).await
    }

    /// Wait for the scheduler to terminate and fully shut down.
    pub async fn wait(&self, cancel: Option<&CancellationToken>) {
        self.master_note.wait_close(cancel).await;
    }

    async fn send(&self, msg: SchedMsg) -> Result<()> {
        tokio::select! {
            sent = self.requests.send(msg) => {
                sent.map_err(|_| Error::SchedulerShutdown)
            }
            _ = self.shutdown.cancelled() => Err(Error::SchedulerShutdown),
        }
    }
}

struct SchedState {
    jobs: Vec<Job>,
    masters: Vec<Arc<LiveMaster>>,
    auto: Vec<bool>,
}

async fn run_loop(
    mut requests: mpsc::Receiver<SchedMsg>,
    shutdown: CancellationToken,
    master_note: Arc<ChangeNotifier>,
) {
    let mut state = SchedState {
        jobs: Vec::new(),
        masters: Vec::new(),
        auto: Vec::new(),
    };
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

    loop {
        let mut recompute = false;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = done_rx.recv() => recompute = true,
            msg = requests.recv() => {
                let Some(msg) = msg else { break };
                handle(msg, &mut state, &master_note, &done_tx, &mut recompute);
            }
        }
        // Serve whatever queued up before the next pass, so reads are
        // never stuck behind a recomputation and back-to-back triggers
        // coalesce into one pass.
        while let Ok(msg) = requests.try_recv() {
            handle(msg, &mut state, &master_note, &done_tx, &mut recompute);
        }
        while done_rx.try_recv().is_ok() {
            recompute = true;
        }
        if recompute {
            reschedule(&state, &done_tx);
        }
    }

    for master in &state.masters {
        master.cancel();
    }
    master_note.close();
}

fn handle(
    msg: SchedMsg,
    state: &mut SchedState,
    master_note: &ChangeNotifier,
    done_tx: &mpsc::Sender<()>,
    recompute: &mut bool,
) {
    match msg {
        SchedMsg::SetJobs(jobs) => {
            state.jobs = jobs;
            *recompute = true;
        }
        SchedMsg::AddMaster(master, auto) => {
            state.masters.push(master);
            state.auto.push(auto);
            master_note.notify();
            *recompute = true;
        }
        SchedMsg::SetAuto(master, auto) => {
            for (idx, known) in state.masters.iter().enumerate() {
                if Arc::ptr_eq(known, &master) {
                    state.auto[idx] = auto;
                    if auto {
                        *recompute = true;
                    }
                    break;
                }
            }
        }
        SchedMsg::Launch { master, job, resp } => {
            start_job(job, master, done_tx.clone(), Some(resp));
        }
        SchedMsg::GetJobs(resp) => {
            let _ = resp.send(state.jobs.clone());
        }
        SchedMsg::GetMasters(resp) => {
            let _ = resp.send((state.masters.clone(), state.auto.clone()));
        }
    }
}

/// One saturation pass: tally what is running on the auto-flagged
/// accepting masters, then start weighted-random picks until either no
/// eligible job or no spare CPU remains.
fn reschedule(state: &SchedState, done_tx: &mpsc::Sender<()>) {
    let available: Vec<Arc<LiveMaster>> = state
        .masters
        .iter()
        .zip(&state.auto)
        .filter(|(master, auto)| **auto && master.accepting())
        .map(|(master, _)| master.clone())
        .collect();

    let mut job_counts: HashMap<String, u32> = HashMap::new();
    let mut cpu_counts: Vec<u32> = vec![0; available.len()];
    for (idx, master) in available.iter().enumerate() {
        for job in master.jobs(0, master.job_count()) {
            if job.running() {
                *job_counts.entry(job.job().id.clone()).or_default() += 1;
                cpu_counts[idx] += job.job().num_cpu;
            }
        }
    }

    let mut pool = PriorityPool::new(&state.jobs, &job_counts);
    let mut rng = rand::thread_rng();
    while pool.total_priority > 0 {
        let pick = pool.sample(&mut rng);
        let job = pool.jobs[pick].clone();

        let mut order: Vec<usize> = (0..available.len()).collect();
        order.shuffle(&mut rng);
        let target = order
            .into_iter()
            .find(|&idx| cpu_counts[idx] + job.num_cpu <= available[idx].slave_info().max_procs);
        let Some(target) = target else {
            // Every master is full; unbounded jobs would loop forever.
            break;
        };

        tracing::debug!(job = %job.name, "auto-starting job");
        cpu_counts[target] += job.num_cpu;
        start_job(job.clone(), available[target].clone(), done_tx.clone(), None);

        let count = job_counts.entry(job.id.clone()).or_default();
        *count += 1;
        if job.max_instances > 0 && *count >= job.max_instances {
            pool.remove(pick);
        }
    }
}

fn start_job(
    job: Job,
    master: Arc<LiveMaster>,
    done_tx: mpsc::Sender<()>,
    resp: Option<oneshot::Sender<Result<Arc<LiveJob>>>>,
) {
    tokio::spawn(async move {
        let result = master.run_job(&job).await;
        if let Err(err) = &result {
            tracing::debug!(job = %job.name, error = %err, "job failed to start");
        }
        let live = result.as_ref().ok().cloned();
        if let Some(resp) = resp {
            let _ = resp.send(result);
        }
        if let Some(live) = live {
            live.wait(None).await;
        }
        // Either way a slot may have opened up; trigger another pass.
        let _ = done_tx.send(()).await;
    });
}

/// Jobs still eligible for auto-scheduling, sampled by priority weight.
struct PriorityPool {
    jobs: Vec<Job>,
    total_priority: u64,
}

impl PriorityPool {
    fn new(jobs: &[Job], running: &HashMap<String, u32>) -> Self {
        let mut pool = Self {
            jobs: Vec::new(),
            total_priority: 0,
        };
        for job in jobs {
            if job.priority == 0 || job.unbounded() {
                continue;
            }
            let count = running.get(&job.id).copied().unwrap_or(0);
            if job.max_instances == 0 || count < job.max_instances {
                pool.total_priority += job.priority as u64;
                pool.jobs.push(job.clone());
            }
        }
        pool
    }

    /// Weighted pick: uniform in `[0, total)` against the cumulative sum.
    fn sample(&self, rng: &mut impl Rng) -> usize {
        let mut remaining = rng.gen_range(0..self.total_priority);
        for (idx, job) in self.jobs.iter().enumerate() {
            let weight = job.priority as u64;
            if remaining < weight {
                return idx;
            }
            remaining -= weight;
        }
        unreachable!("sample on an empty pool")
    }

    fn remove(&mut self, idx: usize) {
        let job = self.jobs.swap_remove(idx);
        self.total_priority -= job.priority as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted_job(name: &str, priority: u32, max_instances: u32, num_cpu: u32) -> Job {
        let mut job = Job::new(name, vec![]);
        job.priority = priority;
        job.max_instances = max_instances;
        job.num_cpu = num_cpu;
        job
    }

    #[test]
    fn pool_excludes_zero_priority_saturated_and_degenerate_jobs() {
        let idle = weighted_job("idle", 0, 1, 1);
        let saturated = weighted_job("saturated", 2, 1, 1);
        let degenerate = weighted_job("degenerate", 3, 0, 0);
        let eligible = weighted_job("eligible", 5, 2, 1);

        let mut running = HashMap::new();
        running.insert(saturated.id.clone(), 1);

        let pool = PriorityPool::new(
            &[idle, saturated, degenerate, eligible.clone()],
            &running,
        );
        assert_eq!(pool.jobs.len(), 1);
        assert_eq!(pool.jobs[0].id, eligible.id);
        assert_eq!(pool.total_priority, 5);
    }

    #[test]
    fn unbounded_jobs_stay_in_the_pool() {
        let unbounded = weighted_job("forever", 1, 0, 2);
        let mut running = HashMap::new();
        running.insert(unbounded.id.clone(), 100);
        let pool = PriorityPool::new(&[unbounded], &running);
        assert_eq!(pool.jobs.len(), 1);
    }

    #[test]
    fn sample_follows_the_weights() {
        let light = weighted_job("light", 1, 10, 1);
        let heavy = weighted_job("heavy", 3, 10, 1);
        let pool = PriorityPool::new(&[light, heavy], &HashMap::new());

        let mut rng = rand::thread_rng();
        let mut heavy_hits = 0;
        const TRIALS: usize = 4000;
        for _ in 0..TRIALS {
            if pool.sample(&mut rng) == 1 {
                heavy_hits += 1;
            }
        }
        // Expected share 3/4; allow generous slack for randomness.
        let share = heavy_hits as f64 / TRIALS as f64;
        assert!((0.68..0.82).contains(&share), "heavy share was {}", share);
    }

    #[test]
    fn remove_keeps_the_total_consistent() {
        let a = weighted_job("a", 2, 1, 1);
        let b = weighted_job("b", 3, 1, 1);
        let mut pool = PriorityPool::new(&[a, b], &HashMap::new());
        assert_eq!(pool.total_priority, 5);
        pool.remove(0);
        assert_eq!(pool.total_priority, 3);
        pool.remove(0);
        assert_eq!(pool.total_priority, 0);
        assert!(pool.jobs.is_empty());
    }
}
