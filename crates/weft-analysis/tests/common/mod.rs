//! Shared fixture for the analysis scenario tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use weft_analysis::context::{AnalysisContext, RegionRequirement};
use weft_analysis::instances::PhysicalManager;
use weft_analysis::operation::{OpHandle, Operation};
use weft_forest::{IndexSpaceExpr, NodeId, RegionTreeForest};
use weft_rt::LoopbackHub;
use weft_types::{
    AddressSpaceId, Color, ContextId, ContextUid, DistributedId, FieldId, FieldMask,
    GenerationId, OpUniqueId, PartitionHandle, RegionHandle, RegionUsage, TreeId,
};

/// Operation test double recording its registered dependences.
pub struct TestOperation {
    uid: OpUniqueId,
    generation: AtomicU64,
    name: String,
    dependences: Mutex<Vec<(OpUniqueId, GenerationId)>>,
    mapping_refs: AtomicI64,
}

impl TestOperation {
    pub fn new(raw_uid: u64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            uid: OpUniqueId(raw_uid),
            generation: AtomicU64::new(0),
            name: name.to_string(),
            dependences: Mutex::new(Vec::new()),
            mapping_refs: AtomicI64::new(0),
        })
    }

    pub fn handle(self: &Arc<Self>) -> OpHandle {
        Arc::clone(self) as OpHandle
    }

    pub fn dependences(&self) -> Vec<(OpUniqueId, GenerationId)> {
        self.dependences.lock().clone()
    }

    pub fn depends_on(&self, other: OpUniqueId) -> bool {
        self.dependences.lock().iter().any(|(uid, _)| *uid == other)
    }

    pub fn mapping_refs(&self) -> i64 {
        self.mapping_refs.load(Ordering::SeqCst)
    }
}

impl Operation for TestOperation {
    fn unique_op_id(&self) -> OpUniqueId {
        self.uid
    }

    fn generation(&self) -> GenerationId {
        GenerationId(self.generation.load(Ordering::SeqCst))
    }

    fn task_name(&self) -> &str {
        &self.name
    }

    fn register_dependence(&self, prior: OpUniqueId, prior_gen: GenerationId) -> bool {
        let mut deps = self.dependences.lock();
        if deps.contains(&(prior, prior_gen)) {
            return false;
        }
        deps.push((prior, prior_gen));
        true
    }

    fn add_mapping_reference(&self, _gen: GenerationId) {
        self.mapping_refs.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_mapping_reference(&self, _gen: GenerationId) {
        self.mapping_refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Physical manager test double.
pub struct TestManager {
    did: DistributedId,
    valid_refs: AtomicI64,
}

impl TestManager {
    pub fn new(raw_did: u64) -> Arc<Self> {
        Arc::new(Self {
            did: DistributedId::new(raw_did).unwrap(),
            valid_refs: AtomicI64::new(0),
        })
    }

    pub fn erased(self: &Arc<Self>) -> Arc<dyn PhysicalManager> {
        Arc::clone(self) as Arc<dyn PhysicalManager>
    }
}

impl PhysicalManager for TestManager {
    fn distributed_id(&self) -> DistributedId {
        self.did
    }

    fn is_virtual_manager(&self) -> bool {
        false
    }

    fn add_valid_ref(&self) {
        self.valid_refs.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_valid_ref(&self) {
        self.valid_refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Install a test-writer subscriber so `--nocapture` runs show the
/// analysis trace. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn f0() -> FieldMask {
    FieldMask::single(FieldId(0))
}

pub fn mask_of(bits: &[u32]) -> FieldMask {
    bits.iter().map(|&b| FieldId(b)).collect()
}

/// A forest with one root `[0, 100 * children)` and one partition of
/// equal-sized children.
pub struct Fixture {
    pub forest: Arc<RegionTreeForest>,
    pub ctx: Arc<AnalysisContext>,
    pub root: NodeId,
    pub partition: NodeId,
    pub children: Vec<NodeId>,
}

pub fn fixture(child_count: u64, disjoint: bool) -> Fixture {
    let forest = Arc::new(RegionTreeForest::new());
    let extent = 100 * child_count.max(1);
    let root = forest.create_region_tree(
        RegionHandle {
            tree_id: TreeId(1),
            index_space: 0,
            field_space: 0,
        },
        IndexSpaceExpr::interval(0, extent - 1),
    );
    let partition = forest.create_partition(
        root,
        Color(0),
        PartitionHandle {
            tree_id: TreeId(1),
            index_partition: 0,
            field_space: 0,
        },
        disjoint,
    );
    let mut children = Vec::new();
    for idx in 0..child_count {
        let child = forest.create_child_region(
            partition,
            Color(idx),
            RegionHandle {
                tree_id: TreeId(1),
                index_space: idx + 1,
                field_space: 0,
            },
            IndexSpaceExpr::interval(idx * 100, idx * 100 + 99),
        );
        children.push(child);
    }
    let hub = LoopbackHub::new();
    let ctx = AnalysisContext::new(
        ContextId(0),
        ContextUid(1),
        AddressSpaceId(0),
        Arc::clone(&forest),
        Arc::new(hub.endpoint(AddressSpaceId(0))),
        Box::new(|_| AddressSpaceId(0)),
    );
    hub.register(AddressSpaceId(0), ctx.clone());
    Fixture {
        forest,
        ctx,
        root,
        partition,
        children,
    }
}

pub fn requirement(parent: NodeId, region: NodeId, usage: RegionUsage, fields: FieldMask) -> RegionRequirement {
    RegionRequirement {
        parent,
        region,
        usage,
        fields,
        projection: None,
    }
}

pub fn analyze(ctx: &AnalysisContext, op: &OpHandle, req: &RegionRequirement) {
    ctx.analyze_logical(op, 0, req, &weft_analysis::LogicalTraceInfo::default())
        .expect("logical analysis failed");
}
