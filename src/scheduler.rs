//! # Cycle Scheduler
//!
//! Runs a handler periodically over a mutable set of items.
//!
//! Deadlines accumulate by exactly one `duration` per tick (not "duration
//! from now"), so pacing does not drift with processing time. The timer
//! task only exists while the set is non-empty.
//!
//! - [`CycleMode::Multi`]: every tick executes every eligible item, in
//!   insertion order.
//! - [`CycleMode::Single`]: every tick executes the first eligible item and
//!   removes it once it resolves; at most one is ever in flight.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// Si el timer se queda más atrás que esto (en ticks), se resincroniza.
const MAX_LAG_TICKS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    Multi,
    Single,
}

/// Callbacks de un scheduler.
#[async_trait]
pub trait CycleHandler<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// ¿Se ejecuta este item en este tick? Los no elegibles se saltan, no se quitan.
    fn filter(&self, _item: &T) -> bool {
        true
    }

    async fn execute(&self, item: Arc<T>) -> anyhow::Result<()>;
}

struct Inner<T> {
    items: Vec<Arc<T>>,
    running: bool,
    deadline: Instant,
    ticks: u64,
}

impl<T> Inner<T> {
    fn position(&self, item: &Arc<T>) -> Option<usize> {
        self.items.iter().position(|i| Arc::ptr_eq(i, item))
    }

    fn remove(&mut self, item: &Arc<T>) -> bool {
        match self.position(item) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }
}

pub struct CycleScheduler<T> {
    name: &'static str,
    duration: Duration,
    mode: CycleMode,
    handler: Arc<dyn CycleHandler<T>>,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for CycleScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            duration: self.duration,
            mode: self.mode,
            handler: self.handler.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> CycleScheduler<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        duration: Duration,
        mode: CycleMode,
        handler: Arc<dyn CycleHandler<T>>,
    ) -> Self {
        Self {
            name,
            duration,
            mode,
            handler,
            inner: Arc::new(Mutex::new(Inner {
                items: Vec::new(),
                running: false,
                deadline: Instant::now(),
                ticks: 0,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Añade un item; arranca el timer si estaba parado. `false` si ya estaba.
    pub fn add(&self, item: Arc<T>) -> bool {
        let mut inner = self.inner.lock();
        if inner.position(&item).is_some() {
            return false;
        }
        inner.items.push(item);

        if !inner.running {
            inner.running = true;
            inner.deadline = Instant::now() + self.duration;
            trace!("⏱️ [{}] timer armado", self.name);
            tokio::spawn(self.clone().run());
        }
        true
    }

    /// Quita el item de forma síncrona; el siguiente tick ya no lo verá.
    pub fn remove(&self, item: &Arc<T>) -> bool {
        self.inner.lock().remove(item)
    }

    pub fn contains(&self, item: &Arc<T>) -> bool {
        self.inner.lock().position(item).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }

    /// Hay un timer activo.
    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Ticks disparados (se cuentan al empezar, no al terminar sus items).
    pub fn ticks(&self) -> u64 {
        self.inner.lock().ticks
    }

    async fn run(self) {
        loop {
            let deadline = self.inner.lock().deadline;
            tokio::time::sleep_until(deadline).await;

            let batch: Vec<Arc<T>> = {
                let mut inner = self.inner.lock();
                inner.ticks += 1;
                let eligible = inner.items.iter().filter(|item| self.handler.filter(item));
                match self.mode {
                    CycleMode::Multi => eligible.cloned().collect(),
                    CycleMode::Single => eligible.take(1).cloned().collect(),
                }
            };

            for item in batch {
                if !self.contains(&item) {
                    continue;
                }
                let outcome = AssertUnwindSafe(self.handler.execute(item.clone()))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {
                        if self.mode == CycleMode::Single {
                            self.remove(&item);
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("⚠️ [{}] item eliminado tras error: {:#}", self.name, e);
                        self.remove(&item);
                    }
                    Err(_) => {
                        error!("💥 [{}] item eliminado tras panic", self.name);
                        self.remove(&item);
                    }
                }
            }

            let mut inner = self.inner.lock();
            if inner.items.is_empty() {
                inner.running = false;
                debug!("⏱️ [{}] sin items, timer detenido", self.name);
                return;
            }

            inner.deadline += self.duration;
            let now = Instant::now();
            if now > inner.deadline + self.duration * MAX_LAG_TICKS {
                debug!(
                    "⏱️ [{}] {:?} de retraso, resincronizando",
                    self.name,
                    now - inner.deadline
                );
                inner.deadline = now + self.duration;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Job {
        id: usize,
        cost: Duration,
        fail: bool,
        eligible: bool,
    }

    impl Job {
        fn new(id: usize) -> Arc<Self> {
            Arc::new(Self {
                id,
                cost: Duration::ZERO,
                fail: false,
                eligible: true,
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        runs: Mutex<Vec<(usize, Instant)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl CycleHandler<Job> for Recorder {
        fn filter(&self, job: &Job) -> bool {
            job.eligible
        }

        async fn execute(&self, job: Arc<Job>) -> anyhow::Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.runs.lock().push((job.id, Instant::now()));
            tokio::time::sleep(job.cost).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if job.fail {
                anyhow::bail!("job {} failed", job.id);
            }
            Ok(())
        }
    }

    fn scheduler(mode: CycleMode) -> (CycleScheduler<Job>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let scheduler = CycleScheduler::new("test", Duration::from_millis(20), mode, recorder.clone());
        (scheduler, recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_do_not_drift_with_processing_time() {
        let (scheduler, recorder) = scheduler(CycleMode::Multi);
        let start = Instant::now();
        // Coste variable entre 0 y 15ms por tick
        let costs = [0u64, 15, 3, 11, 7, 14, 1, 9];
        let jobs: Vec<_> = costs
            .iter()
            .enumerate()
            .map(|(i, ms)| {
                Arc::new(Job {
                    id: i,
                    cost: Duration::from_millis(*ms) / costs.len() as u32,
                    fail: false,
                    eligible: true,
                })
            })
            .collect();
        for job in &jobs {
            scheduler.add(job.clone());
        }

        tokio::time::sleep(Duration::from_millis(20 * 100 + 10)).await;
        let runs = recorder.runs.lock().clone();
        for job in &jobs {
            let fired: Vec<Instant> = runs.iter().filter(|(id, _)| *id == job.id).map(|(_, t)| *t).collect();
            assert_eq!(fired.len(), 100, "job {}", job.id);
            for (n, at) in fired.iter().enumerate() {
                // El n-ésimo tick cae en start + (n+1)*20ms, nunca en el siguiente
                let expected = start + Duration::from_millis(20 * (n as u64 + 1));
                assert!(*at >= expected, "job {} tick {n} fired early", job.id);
                assert!(
                    *at - expected < Duration::from_millis(20),
                    "job {} tick {n} drifted by {:?}",
                    job.id,
                    *at - expected
                );
            }
        }
        assert_eq!(scheduler.ticks(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_item_is_removed_alone() {
        let (scheduler, recorder) = scheduler(CycleMode::Multi);
        let good = Job::new(1);
        let bad = Arc::new(Job {
            id: 2,
            cost: Duration::ZERO,
            fail: true,
            eligible: true,
        });
        scheduler.add(good.clone());
        scheduler.add(bad.clone());

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(scheduler.contains(&good));
        assert!(!scheduler.contains(&bad));
        let runs = recorder.runs.lock();
        assert_eq!(runs.iter().filter(|(id, _)| *id == 2).count(), 1);
        assert_eq!(runs.iter().filter(|(id, _)| *id == 1).count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_items_are_skipped_not_removed() {
        let (scheduler, recorder) = scheduler(CycleMode::Multi);
        let idle = Arc::new(Job {
            id: 1,
            cost: Duration::ZERO,
            fail: false,
            eligible: false,
        });
        scheduler.add(idle.clone());
        assert!(!scheduler.add(idle.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.contains(&idle));
        assert!(recorder.runs.lock().is_empty());
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_stops_when_set_empties() {
        let (scheduler, _) = scheduler(CycleMode::Multi);
        let job = Job::new(1);
        scheduler.add(job.clone());
        assert!(scheduler.is_running());

        scheduler.remove(&job);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!scheduler.is_running());
        let ticks = scheduler.ticks();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.ticks(), ticks);

        // Rearranca al volver a añadir
        scheduler.add(job);
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn single_mode_runs_one_at_a_time_in_order() {
        let (scheduler, recorder) = scheduler(CycleMode::Single);
        for id in 1..=3 {
            scheduler.add(Arc::new(Job {
                id,
                cost: Duration::from_millis(50),
                fail: id == 2,
                eligible: true,
            }));
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        let order: Vec<usize> = recorder.runs.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
        assert!(!scheduler.is_running());
    }
}
