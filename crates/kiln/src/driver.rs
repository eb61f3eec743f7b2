//! Build session driver
//!
//! Wires the dependency topology, the priority work queue, and the cache
//! tier chain into one drainable session. Each build node with uid `U`
//! becomes three topology nodes:
//!
//! - `restore:U` — no build deps; walks the tier chain and restores on hit
//! - `U` — depends on `restore:U` plus the declared deps' action nodes;
//!   skips the real action when the restore hit
//! - `put:U` — after the action; publishes outputs to every tier whose
//!   admission filter accepts them
//!
//! Every task signals `notify_dependants` exactly once on success and
//! never on failure, so a failed action leaves its downstream pending.
//! That pending set is deliberate (siblings keep building, partial results
//! stay usable) and surfaces as [`BuildReport::uncompleted`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::{fs, iter};

use kiln_core::{CacheTier, CancelToken, Codec, TierProbe, Uid};
use kiln_runner::{FnTask, PriorityWorkQueue, ResourceVector, TaskError};
use kiln_topo::Topology;
use tracing::{debug, info, warn};

use crate::config::SessionOptions;
use crate::error::Result;
use crate::node::{Action, BuildNode};
use crate::report::BuildReport;

fn restore_key(uid: &str) -> String {
    format!("restore:{uid}")
}

fn put_key(uid: &str) -> String {
    format!("put:{uid}")
}

/// State the scheduled tasks share through `Arc`.
struct Ctx {
    tiers: Vec<Box<dyn CacheTier>>,
    root: PathBuf,
    codec: Codec,
    hits: Mutex<HashSet<String>>,
    misses: AtomicU64,
    actions: Mutex<HashMap<String, Action>>,
    outputs: HashMap<String, Vec<String>>,
    late_error: Mutex<Option<String>>,
}

impl Ctx {
    fn hit_set(&self) -> MutexGuard<'_, HashSet<String>> {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_hit(&self, uid: &str) -> bool {
        self.hit_set().contains(uid)
    }

    /// Walks the tier chain; an erroring tier falls through to the next.
    fn restore(&self, uid: &Uid) -> bool {
        for tier in &self.tiers {
            match tier.try_restore(uid, &self.root, None) {
                Ok(true) => {
                    debug!(tier = tier.name(), uid = %uid, "cache hit");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        tier = tier.name(),
                        uid = %uid,
                        error = %e,
                        "tier restore failed, falling through"
                    );
                }
            }
        }
        debug!(uid = %uid, "cache miss");
        false
    }

    /// Publishes the node's outputs to every tier that admits them.
    ///
    /// Publication is best effort: a failing tier is logged and the rest
    /// of the chain still gets the entry.
    fn publish(&self, uid: &Uid) {
        let Some(outputs) = self.outputs.get(uid.as_str()) else {
            return;
        };
        let total_size: u64 = outputs
            .iter()
            .map(|p| fs::metadata(self.root.join(p)).map_or(0, |m| m.len()))
            .sum();
        let probe = TierProbe {
            uid,
            total_size,
            paths: outputs,
        };
        for tier in &self.tiers {
            if !tier.fits(&probe) {
                debug!(tier = tier.name(), uid = %uid, "tier declined entry");
                continue;
            }
            match tier.put(uid, &self.root, outputs, self.codec) {
                Ok(true) => debug!(tier = tier.name(), uid = %uid, "published"),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        tier = tier.name(),
                        uid = %uid,
                        error = %e,
                        "tier put failed, continuing"
                    );
                }
            }
        }
    }

    fn take_action(&self, uid: &str) -> Option<Action> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid)
    }

    fn store_late_error(&self, message: String) {
        let mut slot = self.late_error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(message);
        }
    }
}

struct PlanEntry {
    uid: Uid,
    deps: Vec<String>,
    priority: i64,
    cost: ResourceVector,
}

/// A configured set of build nodes plus the tier chain to run them over.
///
/// Tiers are consulted in the order they were added; put the local disk
/// tier first and remote tiers behind it.
pub struct BuildSession {
    options: SessionOptions,
    tiers: Vec<Box<dyn CacheTier>>,
    nodes: Vec<BuildNode>,
    cancel: CancelToken,
}

impl BuildSession {
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            tiers: Vec::new(),
            nodes: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Appends a tier to the fallback chain.
    pub fn add_tier(&mut self, tier: impl CacheTier + 'static) -> &mut Self {
        self.tiers.push(Box::new(tier));
        self
    }

    pub fn add_node(&mut self, node: BuildNode) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// A handle for cancelling the session from another thread.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wires the graph, drains the queue, and reports.
    ///
    /// # Errors
    ///
    /// Structural problems (invalid uid, duplicate node, dependency on an
    /// unknown uid) and worker-pool construction failures return an error
    /// here. Task-action failures do not: they land in the report.
    pub fn run(self) -> Result<BuildReport> {
        let Self {
            options,
            tiers,
            nodes,
            cancel,
        } = self;

        let queue = Arc::new(PriorityWorkQueue::new(
            options.queue.workers,
            options.queue.cap_vector(),
            cancel,
        )?);
        let topo: Arc<Topology<()>> = Arc::new(Topology::new());

        let mut actions = HashMap::new();
        let mut outputs = HashMap::new();
        let mut plan = Vec::with_capacity(nodes.len());
        for node in nodes {
            let uid = Uid::new(&node.uid)?;
            if let Some(action) = node.action {
                actions.insert(node.uid.clone(), action);
            }
            outputs.insert(node.uid.clone(), node.outputs);
            plan.push(PlanEntry {
                uid,
                deps: node.deps,
                priority: node.priority,
                cost: node.cost,
            });
        }

        let ctx = Arc::new(Ctx {
            tiers,
            root: options.root,
            codec: options.codec,
            hits: Mutex::new(HashSet::new()),
            misses: AtomicU64::new(0),
            actions: Mutex::new(actions),
            outputs,
            late_error: Mutex::new(None),
        });

        for entry in &plan {
            let uid = entry.uid.as_str();
            topo.add_node(restore_key(uid), ())?;
            topo.add_node(uid, ())?;
            topo.add_node(put_key(uid), ())?;
        }
        for entry in &plan {
            let uid = entry.uid.as_str();
            let restore = restore_key(uid);
            let action_deps: Vec<&str> = iter::once(restore.as_str())
                .chain(entry.deps.iter().map(String::as_str))
                .collect();
            topo.add_deps(uid, &action_deps)?;
            let put = put_key(uid);
            topo.add_deps(&put, &[uid])?;
        }
        topo.condense_cycles()?;

        info!(nodes = plan.len(), tiers = ctx.tiers.len(), "build session starting");

        // Scheduling fires ready callbacks inline for root nodes, so the
        // whole graph must be added before the first schedule call.
        for entry in &plan {
            schedule_restore(&topo, &queue, &ctx, &entry.uid, entry.priority)?;
            schedule_action(&topo, &queue, &ctx, &entry.uid, entry.priority, entry.cost.clone())?;
            schedule_put(&topo, &queue, &ctx, &entry.uid, entry.priority)?;
        }

        let join_error = queue.join().err();

        let pending: HashSet<String> = topo.get_uncompleted().into_iter().collect();
        let mut completed = Vec::new();
        let mut uncompleted = Vec::new();
        for entry in &plan {
            let uid = entry.uid.as_str();
            if pending.contains(uid) {
                uncompleted.push(uid.to_string());
            } else {
                completed.push(uid.to_string());
            }
        }
        completed.sort();
        uncompleted.sort();

        // Uids cannot contain ':', so a key with one is a restore:/put: node.
        let completion_order: Vec<Vec<String>> = topo
            .replay()
            .into_iter()
            .map(|entry| {
                entry
                    .members
                    .into_iter()
                    .filter(|m| !m.contains(':'))
                    .collect::<Vec<String>>()
            })
            .filter(|members| !members.is_empty())
            .collect();

        let report = BuildReport {
            completed,
            uncompleted,
            hits: ctx.hit_set().len() as u64,
            misses: ctx.misses.load(Ordering::SeqCst),
            first_error: join_error.map(|e| e.to_string()).or_else(|| {
                ctx.late_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
            }),
            completion_order,
            tier_stats: ctx.tiers.iter().map(|t| t.stats()).collect(),
        };

        if report.success() {
            info!(
                completed = report.completed.len(),
                hits = report.hits,
                misses = report.misses,
                "build session complete"
            );
        } else {
            warn!(
                uncompleted = report.uncompleted.len(),
                error = report.first_error.as_deref().unwrap_or("none"),
                "build session left nodes uncompleted"
            );
        }
        Ok(report)
    }
}

fn notify(topo: &Weak<Topology<()>>, key: &str) -> std::result::Result<(), TaskError> {
    let Some(topo) = topo.upgrade() else {
        return Ok(());
    };
    topo.notify_dependants(key)?;
    Ok(())
}

fn enqueue(queue: &PriorityWorkQueue, ctx: &Ctx, task: FnTask) {
    if let Err(e) = queue.add(task) {
        warn!(error = %e, "failed to enqueue task");
        ctx.store_late_error(e.to_string());
    }
}

fn schedule_restore(
    topo: &Arc<Topology<()>>,
    queue: &Arc<PriorityWorkQueue>,
    ctx: &Arc<Ctx>,
    uid: &Uid,
    priority: i64,
) -> Result<()> {
    let key = restore_key(uid.as_str());
    let topo_ref = Arc::downgrade(topo);
    let queue = Arc::clone(queue);
    let ctx = Arc::clone(ctx);
    let uid = uid.clone();
    let task_key = key.clone();
    topo.schedule_node(&key, move |()| {
        let task_ctx = Arc::clone(&ctx);
        let task = FnTask::new(task_key.clone(), move || {
            if task_ctx.restore(&uid) {
                task_ctx.hit_set().insert(uid.as_str().to_string());
            } else {
                task_ctx.misses.fetch_add(1, Ordering::SeqCst);
            }
            notify(&topo_ref, &task_key)
        })
        .with_priority(priority);
        enqueue(&queue, &ctx, task);
    })?;
    Ok(())
}

fn schedule_action(
    topo: &Arc<Topology<()>>,
    queue: &Arc<PriorityWorkQueue>,
    ctx: &Arc<Ctx>,
    uid: &Uid,
    priority: i64,
    cost: ResourceVector,
) -> Result<()> {
    let key = uid.as_str().to_string();
    let topo_ref = Arc::downgrade(topo);
    let queue = Arc::clone(queue);
    let ctx = Arc::clone(ctx);
    let task_key = key.clone();
    topo.schedule_node(&key, move |()| {
        let task_ctx = Arc::clone(&ctx);
        let task = FnTask::new(task_key.clone(), move || {
            if task_ctx.is_hit(&task_key) {
                debug!(uid = %task_key, "cache hit, skipping action");
            } else if let Some(action) = task_ctx.take_action(&task_key) {
                // A failing action returns here without notifying, so its
                // dependants stay pending.
                action()?;
            }
            notify(&topo_ref, &task_key)
        })
        .with_cost(cost)
        .with_priority(priority);
        enqueue(&queue, &ctx, task);
    })?;
    Ok(())
}

fn schedule_put(
    topo: &Arc<Topology<()>>,
    queue: &Arc<PriorityWorkQueue>,
    ctx: &Arc<Ctx>,
    uid: &Uid,
    priority: i64,
) -> Result<()> {
    let key = put_key(uid.as_str());
    let topo_ref = Arc::downgrade(topo);
    let queue = Arc::clone(queue);
    let ctx = Arc::clone(ctx);
    let uid = uid.clone();
    let task_key = key.clone();
    topo.schedule_node(&key, move |()| {
        let task_ctx = Arc::clone(&ctx);
        let task = FnTask::new(task_key.clone(), move || {
            if !task_ctx.is_hit(uid.as_str()) {
                task_ctx.publish(&uid);
            }
            notify(&topo_ref, &task_key)
        })
        .with_priority(priority);
        enqueue(&queue, &ctx, task);
    })?;
    Ok(())
}
