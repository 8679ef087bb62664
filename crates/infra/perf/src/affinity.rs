//! CPU topology discovery, core assignment and pinned worker threads

use crate::error::{PerfError, PerfResult};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

const SYSFS_CPU: &str = "/sys/devices/system/cpu";
const FALLBACK_CORES_PER_NODE: usize = 8;

/// One logical CPU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuCore {
    /// Logical CPU id (what the OS schedules on)
    pub id: usize,
    /// Index of the physical core this CPU belongs to
    pub physical_id: usize,
    /// NUMA node
    pub numa_node: usize,
    /// True for the second and later hardware threads of a physical core
    pub is_hyperthread: bool,
    /// Logical CPUs sharing the physical core, including this one
    pub siblings: Vec<usize>,
}

/// Discovered core layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuTopology {
    cores: Vec<CpuCore>,
}

impl CpuTopology {
    /// Read the layout from sysfs, falling back to a heuristic
    #[must_use]
    pub fn detect() -> Self {
        let logical = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        match Self::from_sysfs(Path::new(SYSFS_CPU), logical) {
            Some(topology) => {
                info!(
                    "Detected {} logical / {} physical cores on {} NUMA nodes",
                    topology.logical_count(),
                    topology.physical_count(),
                    topology.numa_nodes().len()
                );
                topology
            }
            None => {
                debug!("sysfs topology unavailable, assuming 2-way SMT");
                Self::synthetic(logical, 2, FALLBACK_CORES_PER_NODE)
            }
        }
    }

    /// Build a layout where the upper half of CPUs are hyperthread siblings of the lower half
    #[must_use]
    pub fn synthetic(logical: usize, threads_per_core: usize, cores_per_node: usize) -> Self {
        let logical = logical.max(1);
        let threads = threads_per_core.clamp(1, logical);
        let physical = (logical / threads).max(1);
        let per_node = cores_per_node.max(1);

        let cores = (0..logical)
            .map(|id| {
                let physical_id = id % physical;
                let siblings = (0..logical).filter(|other| other % physical == physical_id).collect();
                CpuCore {
                    id,
                    physical_id,
                    numa_node: physical_id / per_node,
                    is_hyperthread: id >= physical,
                    siblings,
                }
            })
            .collect();
        Self { cores }
    }

    /// Layout from explicit cores
    #[must_use]
    pub fn from_cores(cores: Vec<CpuCore>) -> Self {
        Self { cores }
    }

    fn from_sysfs(root: &Path, logical: usize) -> Option<Self> {
        let mut raw = Vec::with_capacity(logical);
        for id in 0..logical {
            let dir = root.join(format!("cpu{id}"));
            let topology = dir.join("topology");
            let package: usize = read_number(&topology.join("physical_package_id"))?;
            let core_id: usize = read_number(&topology.join("core_id"))?;
            let siblings = parse_cpu_list(&std::fs::read_to_string(topology.join("thread_siblings_list")).ok()?)?;
            let numa_node = std::fs::read_dir(&dir)
                .ok()?
                .filter_map(Result::ok)
                .find_map(|entry| entry.file_name().to_str()?.strip_prefix("node")?.parse().ok())
                .unwrap_or(0);
            raw.push((id, (package, core_id), siblings, numa_node));
        }

        let mut physical_ids: FxHashMap<(usize, usize), usize> = FxHashMap::default();
        let cores = raw
            .into_iter()
            .map(|(id, key, siblings, numa_node)| {
                let next = physical_ids.len();
                let physical_id = *physical_ids.entry(key).or_insert(next);
                CpuCore {
                    id,
                    physical_id,
                    numa_node,
                    is_hyperthread: siblings.iter().min().is_some_and(|first| *first != id),
                    siblings,
                }
            })
            .collect();
        Some(Self { cores })
    }

    /// All logical CPUs
    #[must_use]
    pub fn cores(&self) -> &[CpuCore] {
        &self.cores
    }

    /// Logical CPU by id
    #[must_use]
    pub fn core(&self, id: usize) -> Option<&CpuCore> {
        self.cores.iter().find(|c| c.id == id)
    }

    /// Number of logical CPUs
    #[must_use]
    pub fn logical_count(&self) -> usize {
        self.cores.len()
    }

    /// Number of physical cores
    #[must_use]
    pub fn physical_count(&self) -> usize {
        self.cores.iter().filter(|c| !c.is_hyperthread).count()
    }

    /// NUMA node ids, ascending
    #[must_use]
    pub fn numa_nodes(&self) -> Vec<usize> {
        let mut nodes: Vec<usize> = self.cores.iter().map(|c| c.numa_node).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }
}

fn read_number(path: &Path) -> Option<usize> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Parse a sysfs CPU list such as `0-3,8,10-11`
#[must_use]
pub fn parse_cpu_list(list: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.trim().parse().ok()?;
                let end: usize = end.trim().parse().ok()?;
                cpus.extend(start..=end);
            }
            None => cpus.push(part.trim().parse().ok()?),
        }
    }
    Some(cpus)
}

/// Kind of work a thread does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    /// Feed handling
    MarketData,
    /// Order state machine and routing
    OrderProcessing,
    /// Pre-trade checks
    RiskCheck,
    /// Socket I/O
    NetworkIo,
    /// Anything else
    General,
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MarketData => "market_data",
            Self::OrderProcessing => "order_processing",
            Self::RiskCheck => "risk_check",
            Self::NetworkIo => "network_io",
            Self::General => "general",
        };
        f.write_str(name)
    }
}

/// Built-in core selection strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Least-used non-hyperthread core
    LeastUsedPhysical,
    /// Least-used core from the isolated set
    LeastUsedIsolated,
    /// Stay on the NUMA node the workload already runs on
    CacheLocality,
    /// Stay on the NUMA node closest to the NIC
    NetworkProximate,
}

impl SelectionStrategy {
    /// Default strategy per workload
    #[must_use]
    pub const fn for_workload(workload: WorkloadType) -> Self {
        match workload {
            WorkloadType::MarketData | WorkloadType::RiskCheck => Self::LeastUsedIsolated,
            WorkloadType::OrderProcessing => Self::CacheLocality,
            WorkloadType::NetworkIo => Self::NetworkProximate,
            WorkloadType::General => Self::LeastUsedPhysical,
        }
    }

    fn selector(self) -> &'static dyn CoreSelector {
        match self {
            Self::LeastUsedPhysical => &LeastUsedPhysical,
            Self::LeastUsedIsolated => &LeastUsedIsolated,
            Self::CacheLocality => &CacheLocality,
            Self::NetworkProximate => &NetworkProximate,
        }
    }
}

/// Inputs a selector sees
pub struct SelectionContext<'a> {
    /// Machine layout
    pub topology: &'a CpuTopology,
    /// Threads assigned per logical CPU, indexed by position in `topology.cores()`
    pub usage: &'a [u32],
    /// Cores reserved for latency-critical work
    pub isolated: &'a [usize],
    /// NUMA nodes already hosting this workload
    pub workload_nodes: &'a FxHashSet<usize>,
    /// NUMA node closest to the network card
    pub network_node: usize,
}

impl SelectionContext<'_> {
    /// Least-used core among those passing `filter`; ties go to the lowest id
    pub fn least_used(&self, filter: impl Fn(&CpuCore) -> bool) -> Option<usize> {
        self.topology
            .cores()
            .iter()
            .zip(self.usage)
            .filter(|(core, _)| filter(core))
            .min_by_key(|(core, used)| (**used, core.id))
            .map(|(core, _)| core.id)
    }

    fn least_used_physical(&self) -> Option<usize> {
        self.least_used(|c| !c.is_hyperthread).or_else(|| self.least_used(|_| true))
    }
}

/// Pluggable core selection
pub trait CoreSelector: Send + Sync {
    /// Pick a logical CPU id
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<usize>;
}

/// See [`SelectionStrategy::LeastUsedPhysical`]
pub struct LeastUsedPhysical;

impl CoreSelector for LeastUsedPhysical {
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<usize> {
        ctx.least_used_physical()
    }
}

/// See [`SelectionStrategy::LeastUsedIsolated`]
pub struct LeastUsedIsolated;

impl CoreSelector for LeastUsedIsolated {
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<usize> {
        ctx.least_used(|c| ctx.isolated.contains(&c.id))
            .or_else(|| ctx.least_used_physical())
    }
}

/// See [`SelectionStrategy::CacheLocality`]
pub struct CacheLocality;

impl CoreSelector for CacheLocality {
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<usize> {
        ctx.least_used(|c| !c.is_hyperthread && ctx.workload_nodes.contains(&c.numa_node))
            .or_else(|| ctx.least_used_physical())
    }
}

/// See [`SelectionStrategy::NetworkProximate`]
pub struct NetworkProximate;

impl CoreSelector for NetworkProximate {
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<usize> {
        ctx.least_used(|c| !c.is_hyperthread && c.numa_node == ctx.network_node)
            .or_else(|| ctx.least_used_physical())
    }
}

/// Core assignment settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    /// Actually pin threads (assignments are tracked either way)
    pub pin_threads: bool,
    /// Cores kept free of general work
    pub isolated_cores: Vec<usize>,
    /// NUMA node nearest the NIC
    pub network_numa_node: usize,
    /// Per-workload strategy overrides
    pub strategies: BTreeMap<WorkloadType, SelectionStrategy>,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            pin_threads: false,
            isolated_cores: vec![2, 3, 4, 5],
            network_numa_node: 0,
            strategies: BTreeMap::new(),
        }
    }
}

/// A named thread's core
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    /// Thread name
    pub name: String,
    /// Workload class
    pub workload: WorkloadType,
    /// Logical CPU
    pub core: usize,
    /// NUMA node of `core`
    pub numa_node: usize,
}

/// Assigns named workloads to cores and tracks per-core usage
pub struct AffinityManager {
    topology: CpuTopology,
    config: AffinityConfig,
    usage: Vec<AtomicU32>,
    assignments: RwLock<FxHashMap<String, Assignment>>,
}

impl AffinityManager {
    /// Manager over a known topology
    #[must_use]
    pub fn new(topology: CpuTopology, config: AffinityConfig) -> Self {
        let usage = topology.cores().iter().map(|_| AtomicU32::new(0)).collect();
        Self {
            topology,
            config,
            usage,
            assignments: RwLock::new(FxHashMap::default()),
        }
    }

    /// Manager over the detected topology
    #[must_use]
    pub fn detect(config: AffinityConfig) -> Self {
        Self::new(CpuTopology::detect(), config)
    }

    /// Machine layout
    #[must_use]
    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    /// Whether threads should be pinned
    #[must_use]
    pub fn pinning_enabled(&self) -> bool {
        self.config.pin_threads
    }

    /// Assign with the configured strategy for `workload`
    pub fn assign(&self, name: &str, workload: WorkloadType) -> PerfResult<Assignment> {
        let strategy = self
            .config
            .strategies
            .get(&workload)
            .copied()
            .unwrap_or_else(|| SelectionStrategy::for_workload(workload));
        self.assign_with(name, workload, strategy.selector())
    }

    /// Assign with an explicit selector. Re-assigning a name returns its existing core.
    pub fn assign_with(&self, name: &str, workload: WorkloadType, selector: &dyn CoreSelector) -> PerfResult<Assignment> {
        let mut assignments = self.assignments.write();
        if let Some(existing) = assignments.get(name) {
            return Ok(existing.clone());
        }

        let usage: Vec<u32> = self.usage.iter().map(|u| u.load(Ordering::Relaxed)).collect();
        let workload_nodes: FxHashSet<usize> = assignments
            .values()
            .filter(|a| a.workload == workload)
            .map(|a| a.numa_node)
            .collect();
        let ctx = SelectionContext {
            topology: &self.topology,
            usage: &usage,
            isolated: &self.config.isolated_cores,
            workload_nodes: &workload_nodes,
            network_node: self.config.network_numa_node,
        };

        let core_id = selector.select(&ctx).ok_or(PerfError::NoCores)?;
        let (index, core) = self
            .topology
            .cores()
            .iter()
            .enumerate()
            .find(|(_, c)| c.id == core_id)
            .ok_or(PerfError::UnknownCore(core_id))?;
        self.usage[index].fetch_add(1, Ordering::Relaxed);

        let assignment = Assignment {
            name: name.to_string(),
            workload,
            core: core.id,
            numa_node: core.numa_node,
        };
        assignments.insert(name.to_string(), assignment.clone());
        debug!("Assigned {} ({}) to core {}", name, workload, core.id);
        Ok(assignment)
    }

    /// Drop an assignment and free its usage slot
    pub fn release(&self, name: &str) -> Option<Assignment> {
        let assignment = self.assignments.write().remove(name)?;
        if let Some(index) = self.topology.cores().iter().position(|c| c.id == assignment.core) {
            // saturating: never wraps below zero
            let _ = self.usage[index].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |u| Some(u.saturating_sub(1)));
        }
        Some(assignment)
    }

    /// Threads assigned per logical CPU, in topology order
    #[must_use]
    pub fn usage(&self) -> Vec<(usize, u32)> {
        self.topology
            .cores()
            .iter()
            .zip(&self.usage)
            .map(|(core, used)| (core.id, used.load(Ordering::Relaxed)))
            .collect()
    }

    /// Current assignments sorted by name
    #[must_use]
    pub fn assignments(&self) -> Vec<Assignment> {
        let mut list: Vec<Assignment> = self.assignments.read().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

/// Handle to a thread started by [`ThreadManager::spawn`]
pub struct PinnedThread<T> {
    /// Core the thread was assigned
    pub assignment: Assignment,
    handle: JoinHandle<T>,
}

impl<T> PinnedThread<T> {
    /// Wait for the thread to finish
    pub fn join(self) -> PerfResult<T> {
        self.handle
            .join()
            .map_err(|_| PerfError::ThreadPanicked(self.assignment.name))
    }

    /// True once the thread has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

struct AssignmentGuard {
    manager: Arc<AffinityManager>,
    name: String,
}

impl Drop for AssignmentGuard {
    fn drop(&mut self) {
        self.manager.release(&self.name);
    }
}

/// Spawns named OS threads on assigned cores
#[derive(Clone)]
pub struct ThreadManager {
    affinity: Arc<AffinityManager>,
}

impl ThreadManager {
    /// Manager sharing `affinity`
    #[must_use]
    pub fn new(affinity: Arc<AffinityManager>) -> Self {
        Self { affinity }
    }

    /// Underlying affinity manager
    #[must_use]
    pub fn affinity(&self) -> &Arc<AffinityManager> {
        &self.affinity
    }

    /// Spawn `f` on a thread named `name`, pinned when pinning is enabled.
    ///
    /// The assignment is released when the thread exits, including on panic.
    pub fn spawn<F, T>(&self, name: &str, workload: WorkloadType, f: F) -> PerfResult<PinnedThread<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let assignment = self.affinity.assign(name, workload)?;
        let guard = AssignmentGuard {
            manager: Arc::clone(&self.affinity),
            name: name.to_string(),
        };
        let pin = self.affinity.pinning_enabled();
        let core = assignment.core;
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _guard = guard;
                if pin {
                    if core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                        debug!("Thread {} pinned to core {}", thread_name, core);
                    } else {
                        warn!("Failed to pin thread {} to core {}", thread_name, core);
                    }
                }
                f()
            });

        match handle {
            Ok(handle) => Ok(PinnedThread { assignment, handle }),
            Err(e) => {
                self.affinity.release(name);
                Err(PerfError::Spawn(e))
            }
        }
    }
}
