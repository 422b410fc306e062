//! Scheduler component — places tasks onto node slots.
//!
//! Placement is first-fit by rank-compactness: ranks fill the
//! lowest-indexed nodes first, and within a node each rank claims the
//! lowest-indexed free core window of the required width.  Tasks that do
//! not fit wait in a FIFO list per priority class and are re-tried whenever
//! the executor releases slots.

use std::collections::{BTreeMap, HashSet, VecDeque};

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{ControlBus, StateBus, TaskQueueSender};
use crate::error::AgentError;
use crate::messages::ControlMessage;
use crate::rm::RmInfo;
use crate::task::{RankSlot, SlotAssignment, Task, TaskDescription, TaskState};

use super::{Component, ComponentFuture, advance, cancel_to_output, fail_to_output, publish_state};

// ── SlotAllocator ─────────────────────────────────────────────────────────────

struct NodeFree {
    index: usize,
    name: String,
    cores: Vec<bool>,
    gpus: Vec<bool>,
}

/// Per-node free-core and free-gpu maps.  `true` means free.
pub struct SlotAllocator {
    nodes: Vec<NodeFree>,
}

impl SlotAllocator {
    pub fn new(info: &RmInfo) -> Self {
        let nodes = info
            .nodes
            .iter()
            .map(|n| NodeFree {
                index: n.index,
                name: n.name.clone(),
                cores: vec![true; n.cores],
                gpus: vec![true; n.gpus],
            })
            .collect();
        Self { nodes }
    }

    /// Whether the request could ever be satisfied by an empty inventory.
    pub fn fits_inventory(&self, td: &TaskDescription) -> bool {
        let cores_per_rank = td.cores_per_rank as usize;
        let gpus_per_rank = td.gpus_per_rank as usize;
        let ranks = td.ranks as usize;

        let per_node_ok = self
            .nodes
            .iter()
            .any(|n| cores_per_rank <= n.cores.len() && gpus_per_rank <= n.gpus.len());
        if !per_node_ok {
            return false;
        }
        let max_ranks: usize = self
            .nodes
            .iter()
            .map(|n| {
                let by_cores = n.cores.len() / cores_per_rank.max(1);
                if gpus_per_rank == 0 { by_cores } else { by_cores.min(n.gpus.len() / gpus_per_rank) }
            })
            .sum();
        ranks <= max_ranks
    }

    /// Lowest-indexed free core window of width `width`, if any.
    fn find_window(cores: &[bool], width: usize) -> Option<usize> {
        if width == 0 || width > cores.len() {
            return None;
        }
        let mut run = 0;
        for (i, free) in cores.iter().enumerate() {
            if *free {
                run += 1;
                if run == width {
                    return Some(i + 1 - width);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn take_gpus(gpus: &mut [bool], count: usize) -> Option<Vec<usize>> {
        let free: Vec<usize> =
            gpus.iter().enumerate().filter(|(_, g)| **g).map(|(i, _)| i).take(count).collect();
        if free.len() < count {
            return None;
        }
        for &i in &free {
            gpus[i] = false;
        }
        Some(free)
    }

    /// Try to place every rank of the task; `None` leaves the maps untouched.
    pub fn try_place(&mut self, td: &TaskDescription) -> Option<SlotAssignment> {
        let cores_per_rank = td.cores_per_rank as usize;
        let gpus_per_rank = td.gpus_per_rank as usize;
        let mut remaining = td.ranks as usize;
        let mut placed: Vec<RankSlot> = Vec::new();

        'nodes: for node in &mut self.nodes {
            while remaining > 0 {
                let Some(start) = Self::find_window(&node.cores, cores_per_rank) else {
                    continue 'nodes;
                };
                let gpus = if gpus_per_rank > 0 {
                    match Self::take_gpus(&mut node.gpus, gpus_per_rank) {
                        Some(g) => g,
                        None => continue 'nodes,
                    }
                } else {
                    Vec::new()
                };
                let cores: Vec<usize> = (start..start + cores_per_rank).collect();
                for &c in &cores {
                    node.cores[c] = false;
                }
                placed.push(RankSlot {
                    node_index: node.index,
                    node_name: node.name.clone(),
                    cores,
                    gpus,
                });
                remaining -= 1;
            }
            break;
        }

        if remaining > 0 {
            let rollback = SlotAssignment { ranks: placed };
            self.release(&rollback);
            return None;
        }
        Some(SlotAssignment { ranks: placed })
    }

    /// Return a slot assignment's cores and gpus to the free maps.
    pub fn release(&mut self, slots: &SlotAssignment) {
        for rank in &slots.ranks {
            if let Some(node) = self.nodes.iter_mut().find(|n| n.index == rank.node_index) {
                for &c in &rank.cores {
                    node.cores[c] = true;
                }
                for &g in &rank.gpus {
                    node.gpus[g] = true;
                }
            }
        }
    }
}

// ── SchedulerComponent ────────────────────────────────────────────────────────

pub struct SchedulerComponent {
    uid: String,
    rx: mpsc::Receiver<Vec<Task>>,
    executing: TaskQueueSender,
    output: TaskQueueSender,
    /// Destination for function tasks bound to a raptor master.
    raptor: Option<TaskQueueSender>,
    control: ControlBus,
    control_rx: broadcast::Receiver<ControlMessage>,
    state: StateBus,
    heartbeat_interval: Duration,
    allocator: SlotAllocator,
    /// FIFO per priority class; higher priority drains first.
    waitlist: BTreeMap<i32, VecDeque<Task>>,
    cancelled: HashSet<String>,
}

impl SchedulerComponent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rm_info: &RmInfo,
        rx: mpsc::Receiver<Vec<Task>>,
        executing: TaskQueueSender,
        output: TaskQueueSender,
        raptor: Option<TaskQueueSender>,
        control: ControlBus,
        state: StateBus,
        heartbeat_interval: Duration,
    ) -> Self {
        let control_rx = control.subscribe();
        Self {
            uid: "scheduler.0".to_string(),
            rx,
            executing,
            output,
            raptor,
            control,
            control_rx,
            state,
            heartbeat_interval,
            allocator: SlotAllocator::new(rm_info),
            waitlist: BTreeMap::new(),
            cancelled: HashSet::new(),
        }
    }

    async fn work(&mut self, tasks: Vec<Task>) -> Result<(), AgentError> {
        for mut task in tasks {
            task.advance_to(TaskState::AgentScheduling)?;
            publish_state(&self.uid, &task, &self.state);

            if self.cancelled.remove(&task.uid) {
                cancel_to_output(&self.uid, task, &self.state, &self.output).await?;
                continue;
            }

            // Raptor-bound function tasks bypass slot placement entirely.
            if task.description.raptor_id.is_some() && task.description.mode.is_function_typed() {
                match &self.raptor {
                    Some(raptor) => raptor.push(vec![task]).await?,
                    None => {
                        let err = AgentError::Resource(format!(
                            "task {} is raptor-bound but no raptor router is running",
                            task.uid
                        ));
                        fail_to_output(&self.uid, task, &err, &self.state, &self.output).await?;
                    }
                }
                continue;
            }

            if !self.allocator.fits_inventory(&task.description) {
                let err = AgentError::Resource(format!(
                    "task {} requests {} rank(s) x {} core(s) beyond total inventory",
                    task.uid, task.description.ranks, task.description.cores_per_rank
                ));
                fail_to_output(&self.uid, task, &err, &self.state, &self.output).await?;
                continue;
            }

            match self.allocator.try_place(&task.description) {
                Some(slots) => self.dispatch(task, slots).await?,
                None => {
                    debug!(uid = %task.uid, "no free slots, waitlisting");
                    self.waitlist
                        .entry(task.description.priority)
                        .or_default()
                        .push_back(task);
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, mut task: Task, slots: SlotAssignment) -> Result<(), AgentError> {
        debug!(uid = %task.uid, ranks = slots.ranks.len(), "task placed");
        task.slots = Some(slots);
        advance(&self.uid, vec![task], TaskState::AgentExecutingPending, &self.state, &self.executing)
            .await
    }

    /// Re-evaluate waitlist heads after a slot release, highest priority
    /// class first.  Within a class only the head is considered, preserving
    /// FIFO fairness.
    async fn rescan(&mut self) -> Result<(), AgentError> {
        let priorities: Vec<i32> = self.waitlist.keys().rev().cloned().collect();
        for prio in priorities {
            while let Some(task) = self.pop_waitlist_head(prio) {
                if self.cancelled.remove(&task.uid) {
                    cancel_to_output(&self.uid, task, &self.state, &self.output).await?;
                    continue;
                }
                match self.allocator.try_place(&task.description) {
                    Some(slots) => self.dispatch(task, slots).await?,
                    None => {
                        // Head still does not fit; keep its class FIFO.
                        self.waitlist.entry(prio).or_default().push_front(task);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn pop_waitlist_head(&mut self, prio: i32) -> Option<Task> {
        let queue = self.waitlist.get_mut(&prio)?;
        let task = queue.pop_front();
        if queue.is_empty() {
            self.waitlist.remove(&prio);
        }
        task
    }

    async fn handle_cancel(&mut self, uids: Vec<String>) -> Result<(), AgentError> {
        self.cancelled.extend(uids.iter().cloned());

        // Waiting tasks leave immediately; placed tasks keep their slots
        // until the executor confirms process exit.
        let mut dropped = Vec::new();
        for queue in self.waitlist.values_mut() {
            let mut keep = VecDeque::with_capacity(queue.len());
            while let Some(task) = queue.pop_front() {
                if uids.contains(&task.uid) {
                    self.cancelled.remove(&task.uid);
                    dropped.push(task);
                } else {
                    keep.push_back(task);
                }
            }
            *queue = keep;
        }
        self.waitlist.retain(|_, q| !q.is_empty());

        for task in dropped {
            cancel_to_output(&self.uid, task, &self.state, &self.output).await?;
        }
        Ok(())
    }
}

impl Component for SchedulerComponent {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(async move {
            let mut this = *self;
            let mut beat = interval(this.heartbeat_interval);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => return Ok(()),

                    msg = this.control_rx.recv() => match msg {
                        Ok(ControlMessage::SlotRelease { uid, slots }) => {
                            debug!(%uid, "slots released");
                            this.allocator.release(&slots);
                            this.rescan().await?;
                        }
                        Ok(ControlMessage::CancelTasks { uids }) => {
                            this.handle_cancel(uids).await?;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "scheduler lagged on control bus");
                        }
                        Err(_) => return Err(AgentError::Transport("control bus closed".into())),
                    },

                    _ = beat.tick() => {
                        this.control.publish(ControlMessage::heartbeat(&this.uid));
                    }

                    batch = this.rx.recv() => match batch {
                        Some(tasks) => this.work(tasks).await?,
                        None => return Err(AgentError::Transport("scheduling queue closed".into())),
                    },
                }
            }
        })
    }
}
