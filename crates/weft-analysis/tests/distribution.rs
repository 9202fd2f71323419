//! Versioning-layer tests: equivalence-set partitioning and the remote
//! version-manager protocol over the loopback transport.

mod common;

use std::sync::Arc;

use common::{TestOperation, f0, fixture, requirement};
use weft_analysis::AnalysisContext;
use weft_analysis::version::VersionInfo;
use weft_rt::LoopbackHub;
use weft_types::{AddressSpaceId, ContextId, ContextUid, RegionUsage};

#[test]
fn test_equivalence_sets_partition_the_node() {
    let fx = fixture(2, true);
    let op = TestOperation::new(1, "toucher");

    // Touch both children so the root's set splits along the partition.
    for &child in &fx.children {
        let mut info = VersionInfo::new();
        let req = requirement(fx.root, child, RegionUsage::read_write(), f0());
        let (_ready, applied) = fx
            .ctx
            .analyze_version(&op.handle(), 0, &req, &mut info)
            .unwrap();
        assert_eq!(info.equivalence_sets().len(), 1);
        assert_eq!(
            info.equivalence_sets()[0].expr(),
            &fx.forest.expr(child)
        );
        for event in applied {
            event.trigger(false);
        }
    }

    // The root now reports the pieces: disjoint, covering everything.
    let mut info = VersionInfo::new();
    let req = requirement(fx.root, fx.root, RegionUsage::read_only(), f0());
    fx.ctx
        .analyze_version(&op.handle(), 0, &req, &mut info)
        .unwrap();
    let sets = info.equivalence_sets();
    assert_eq!(sets.len(), 2);
    assert!(!sets[0].expr().intersects(sets[1].expr()));
    let union = sets[0].expr().union(sets[1].expr());
    assert_eq!(union, fx.forest.expr(fx.root));
}

#[test]
fn test_exclusive_acquisition_orders_writers() {
    let fx = fixture(2, true);
    let writer = TestOperation::new(1, "writer");
    let reader = TestOperation::new(2, "reader");

    let mut writer_info = VersionInfo::new();
    let write_req = requirement(fx.root, fx.root, RegionUsage::read_write(), f0());
    let (writer_ready, writer_applied) = fx
        .ctx
        .analyze_version(&writer.handle(), 0, &write_req, &mut writer_info)
        .unwrap();
    assert!(writer_ready.is_empty());

    let mut reader_info = VersionInfo::new();
    let read_req = requirement(fx.root, fx.root, RegionUsage::read_only(), f0());
    let (reader_ready, reader_applied) = fx
        .ctx
        .analyze_version(&reader.handle(), 0, &read_req, &mut reader_info)
        .unwrap();
    assert_eq!(reader_ready.len(), 1);
    assert!(!reader_ready[0].has_triggered());

    // The writer completing releases the reader; the committed version
    // advances exactly once.
    for event in writer_applied {
        event.trigger(false);
    }
    assert!(reader_ready[0].has_triggered());
    assert_eq!(writer_info.equivalence_sets()[0].version(), 1);
    for event in reader_applied {
        event.trigger(false);
    }
    assert_eq!(reader_info.equivalence_sets()[0].version(), 1);
}

/// Two simulated address spaces: space 1 pulls the root's equivalence sets
/// from the owner on space 0 through the wire protocol.
#[test]
fn test_remote_version_manager_round_trip() {
    common::init_tracing();
    let fx = fixture(2, true);
    let hub = LoopbackHub::new();
    let owner_space = AddressSpaceId(0);
    let remote_space = AddressSpaceId(1);
    let ctx_owner = AnalysisContext::new(
        ContextId(0),
        ContextUid(7),
        owner_space,
        Arc::clone(&fx.forest),
        Arc::new(hub.endpoint(owner_space)),
        Box::new(move |_| AddressSpaceId(0)),
    );
    let ctx_remote = AnalysisContext::new(
        ContextId(0),
        ContextUid(7),
        remote_space,
        Arc::clone(&fx.forest),
        Arc::new(hub.endpoint(remote_space)),
        Box::new(move |_| AddressSpaceId(0)),
    );
    hub.register(owner_space, ctx_owner.clone());
    hub.register(remote_space, ctx_remote.clone());

    let op = TestOperation::new(1, "remote_reader");
    let mut info = VersionInfo::new();
    let req = requirement(fx.root, fx.root, RegionUsage::read_only(), f0());
    ctx_remote
        .analyze_version(&op.handle(), 0, &req, &mut info)
        .unwrap();

    assert_eq!(info.equivalence_sets().len(), 1);
    let remote_set = &info.equivalence_sets()[0];
    assert_eq!(remote_set.expr(), &fx.forest.expr(fx.root));
    assert_eq!(remote_set.owner_space(), owner_space);

    // The owner's manager minted the id; the remote holds the same one.
    let owner_sets = ctx_owner.version_manager(fx.root).equivalence_sets();
    assert_eq!(owner_sets.len(), 1);
    assert_eq!(owner_sets[0].did(), remote_set.did());

    // A second remote analysis answers from the cache without traffic.
    let mut again = VersionInfo::new();
    ctx_remote
        .analyze_version(&op.handle(), 0, &req, &mut again)
        .unwrap();
    assert_eq!(again.equivalence_sets().len(), 1);
}

#[test]
fn test_versioning_invalidation_recomputes() {
    let fx = fixture(2, true);
    let op = TestOperation::new(1, "toucher");
    let req = requirement(fx.root, fx.root, RegionUsage::read_only(), f0());
    let mut info = VersionInfo::new();
    fx.ctx
        .analyze_version(&op.handle(), 0, &req, &mut info)
        .unwrap();
    let first_did = info.equivalence_sets()[0].did();

    fx.ctx.invalidate_context();
    fx.ctx.initialize_context();

    let mut after = VersionInfo::new();
    fx.ctx
        .analyze_version(&op.handle(), 0, &req, &mut after)
        .unwrap();
    assert_eq!(after.equivalence_sets().len(), 1);
    // Fresh lazy computation mints a fresh set.
    assert_ne!(after.equivalence_sets()[0].did(), first_did);
}
