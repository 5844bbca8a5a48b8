#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use bamcode::format::BamObjectCode;
use bamcode::io::DataSource;
use bamcode::{
    Bam, BamError, BamFile, BamInspector, BamObject, BamReader, ObjectId, Ptr, Registry,
    WritableRef,
};
use common::{Parent, StreamBuilder, define_type, init_tracing};

#[derive(Debug, Default, BamObject)]
struct Node {
    label: String,
    #[bam(pointer)]
    next: Ptr<Node>,
}

#[derive(Debug, Default, BamObject)]
struct Pair {
    #[bam(pointer)]
    left: Ptr<Node>,
    #[bam(pointer)]
    right: Ptr<Node>,
}

#[derive(Debug, Default, BamObject)]
struct Group {
    name: String,
    #[bam(pointer)]
    members: Vec<Ptr<Node>>,
}

fn registry() -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.register::<Node>();
    registry.register::<Pair>();
    registry.register::<Group>();
    Arc::new(registry)
}

fn node(label: &str) -> WritableRef {
    WritableRef::new(Node {
        label: label.to_string(),
        next: Ptr::null(),
    })
}

fn link(from: &WritableRef, to: Option<&WritableRef>) -> bamcode::Result<()> {
    let mut from = from
        .downcast_mut::<Node>()
        .ok_or_else(|| BamError::Logic("not a node".into()))?;
    from.next = match to {
        Some(to) => Ptr::new(to.clone())?,
        None => Ptr::null(),
    };
    Ok(())
}

fn label(object: &WritableRef) -> String {
    object
        .downcast_ref::<Node>()
        .map(|n| n.label.clone())
        .unwrap_or_default()
}

fn next(object: &WritableRef) -> Option<WritableRef> {
    object
        .downcast_ref::<Node>()
        .and_then(|n| n.next.get().cloned())
}

#[test]
fn plain_fields_round_trip() -> bamcode::Result<()> {
    init_tracing();
    let registry = registry();
    let original = node("solo");

    let bytes = Bam::serialize(&registry, &original)?;
    let loaded = Bam::deserialize(&registry, &bytes)?;

    assert!(loaded.is::<Node>());
    assert_eq!(label(&loaded), "solo");
    assert!(next(&loaded).is_none());
    Ok(())
}

#[test]
fn shared_target_is_written_once_and_read_back_shared() -> bamcode::Result<()> {
    init_tracing();
    let registry = registry();
    let shared = node("shared");
    let pair = WritableRef::new(Pair {
        left: Ptr::new(shared.clone())?,
        right: Ptr::new(shared.clone())?,
    });

    let bytes = Bam::serialize(&registry, &pair)?;

    let report = BamInspector::inspect_bytes(&bytes)?;
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].root.object_id, 1);
    assert_eq!(report.groups[0].adjuncts.len(), 1);
    assert_eq!(report.groups[0].adjuncts[0].object_id, 2);

    let loaded = Bam::deserialize(&registry, &bytes)?;
    let loaded = loaded
        .downcast_ref::<Pair>()
        .ok_or_else(|| BamError::Logic("expected a pair".into()))?;
    assert!(loaded.left.ptr_eq(&loaded.right));
    assert_eq!(loaded.left.borrow().map(|n| n.label.clone()).as_deref(), Some("shared"));
    Ok(())
}

#[test]
fn ids_follow_breadth_first_discovery() -> bamcode::Result<()> {
    let registry = registry();
    let a = node("a");
    let b = node("b");
    let c = node("c");
    link(&a, Some(&c))?;
    let group = WritableRef::new(Group {
        name: "g".into(),
        members: vec![Ptr::new(a)?, Ptr::new(b)?],
    });

    let bytes = Bam::serialize(&registry, &group)?;
    let report = BamInspector::inspect_bytes(&bytes)?;
    let ids: Vec<u32> = report.groups[0].adjuncts.iter().map(|r| r.object_id).collect();
    assert_eq!(ids, vec![2, 3, 4]);

    let loaded = Bam::deserialize(&registry, &bytes)?;
    let loaded = loaded
        .downcast_ref::<Group>()
        .ok_or_else(|| BamError::Logic("expected a group".into()))?;
    let labels: Vec<String> = loaded
        .members
        .iter()
        .filter_map(|m| m.borrow().map(|n| n.label.clone()))
        .collect();
    assert_eq!(labels, vec!["a", "b"]);
    let third = loaded.members[0].borrow().and_then(|n| n.next.get().cloned());
    assert_eq!(third.map(|n| label(&n)).as_deref(), Some("c"));
    Ok(())
}

#[test]
fn two_node_cycle_survives() -> bamcode::Result<()> {
    init_tracing();
    let registry = registry();
    let a = node("a");
    let b = node("b");
    link(&a, Some(&b))?;
    link(&b, Some(&a))?;

    let bytes = Bam::serialize(&registry, &a)?;
    let root = Bam::deserialize(&registry, &bytes)?;

    let second = next(&root).ok_or_else(|| BamError::Logic("lost b".into()))?;
    assert_eq!(label(&second), "b");
    let back = next(&second).ok_or_else(|| BamError::Logic("lost a".into()))?;
    assert!(back.ptr_eq(&root));

    // Break both cycles so the objects are dropped.
    link(&a, None)?;
    link(&root, None)?;
    Ok(())
}

#[test]
fn self_pointer_survives() -> bamcode::Result<()> {
    let registry = registry();
    let a = node("ouroboros");
    link(&a, Some(&a))?;

    let bytes = Bam::serialize(&registry, &a)?;
    let report = BamInspector::inspect_bytes(&bytes)?;
    assert!(report.groups[0].adjuncts.is_empty());

    let root = Bam::deserialize(&registry, &bytes)?;
    assert!(next(&root).is_some_and(|n| n.ptr_eq(&root)));

    link(&a, None)?;
    link(&root, None)?;
    Ok(())
}

#[test]
fn objects_shared_across_roots_keep_their_identity() -> bamcode::Result<()> {
    let registry = registry();
    let shared = node("shared");
    let first = node("first");
    let second = node("second");
    link(&first, Some(&shared))?;
    link(&second, Some(&shared))?;

    let bytes = Bam::builder().serialize(&registry, &[first, second])?;
    let report = BamInspector::inspect_bytes(&bytes)?;
    assert_eq!(report.groups.len(), 2);
    assert!(report.groups[1].adjuncts.is_empty());

    let roots = Bam::builder().deserialize_all(&registry, &bytes)?;
    assert_eq!(roots.len(), 2);
    let a = next(&roots[0]).ok_or_else(|| BamError::Logic("lost target".into()))?;
    let b = next(&roots[1]).ok_or_else(|| BamError::Logic("lost target".into()))?;
    assert!(a.ptr_eq(&b));
    Ok(())
}

#[test]
fn rewriting_a_root_reads_back_the_same_object() -> bamcode::Result<()> {
    let registry = registry();
    let root = node("again");

    let bytes = Bam::builder().serialize(&registry, &[root.clone(), root])?;
    let report = BamInspector::inspect_bytes(&bytes)?;
    assert_eq!(report.groups.len(), 2);
    assert_eq!(report.groups[1].root.type_index, 0);
    assert_eq!(report.groups[1].root.object_id, 1);

    let mut reader = BamReader::new(Arc::clone(&registry), DataSource::Memory(bytes))?;
    let first = reader.read_object()?.ok_or_else(|| BamError::Logic("empty".into()))?;
    let second = reader.read_object()?.ok_or_else(|| BamError::Logic("short".into()))?;
    assert!(first.ptr_eq(&second));
    assert!(reader.read_object()?.is_none());
    assert!(reader.resolve()?);
    Ok(())
}

#[test]
fn dropped_objects_are_announced_and_forgotten() -> bamcode::Result<()> {
    init_tracing();
    let registry = registry();
    let mut out = Vec::new();
    {
        let mut writer =
            bamcode::BamWriter::new(Arc::clone(&registry), bamcode::io::DatagramSink::new(&mut out));
        let first = node("first");
        writer.write_object(&first)?;
        assert!(writer.has_object(&first));
        drop(first);
        writer.write_object(&node("second"))?;
        writer.finish()?;
    }

    let report = BamInspector::inspect_bytes(&out)?;
    assert_eq!(report.removals.len(), 1);
    assert_eq!(report.removals[0].ids, vec![1]);
    assert_eq!(report.groups[1].root.object_id, 2);

    let mut reader = BamReader::new(Arc::clone(&registry), DataSource::Memory(out))?;
    let first = reader.read_object()?.ok_or_else(|| BamError::Logic("empty".into()))?;
    let second = reader.read_object()?.ok_or_else(|| BamError::Logic("short".into()))?;
    assert_eq!(label(&first), "first");
    assert_eq!(label(&second), "second");
    assert!(reader.object(ObjectId::new(1)).is_none());
    assert!(reader.object(ObjectId::new(2)).is_some());
    Ok(())
}

fn forward_reference_stream(define_target: bool) -> bamcode::Result<Vec<u8>> {
    let mut stream = StreamBuilder::new();

    let mut first = stream.record(BamObjectCode::Push);
    define_type(&mut first, 2, "Node", Parent::Root { index: 1, first: true });
    first.add_u32(1);
    first.add_string("first")?;
    first.add_u32(if define_target { 2 } else { 7 });
    stream.frame(&first).pop();

    if define_target {
        let mut second = stream.record(BamObjectCode::Push);
        second.add_u16(2);
        second.add_u32(2);
        second.add_string("second")?;
        second.add_u32(0);
        stream.frame(&second).pop();
    }
    Ok(stream.finish())
}

#[test]
fn forward_reference_waits_for_a_later_group() -> bamcode::Result<()> {
    init_tracing();
    let registry = registry();
    let bytes = forward_reference_stream(true)?;

    let mut reader = BamReader::new(Arc::clone(&registry), DataSource::Memory(bytes.clone()))?;
    let first = reader.read_object()?.ok_or_else(|| BamError::Logic("empty".into()))?;
    assert!(!reader.resolve()?);
    assert_eq!(reader.pending_count(), 1);
    assert!(next(&first).is_none());

    let second = reader.read_object()?.ok_or_else(|| BamError::Logic("short".into()))?;
    assert!(reader.resolve()?);
    assert!(next(&first).is_some_and(|n| n.ptr_eq(&second)));

    // The file façade does the same bookkeeping in one call.
    let mut file = BamFile::new(registry);
    file.open_read_bytes(bytes)?;
    let root = file.read_root()?.ok_or_else(|| BamError::Logic("empty".into()))?;
    assert_eq!(next(&root).map(|n| label(&n)).as_deref(), Some("second"));
    assert!(file.read_root()?.is_none());
    assert!(file.is_eof());
    Ok(())
}

#[test]
fn dangling_reference_is_reported_at_end_of_stream() -> bamcode::Result<()> {
    init_tracing();
    let registry = registry();
    let bytes = forward_reference_stream(false)?;

    let mut reader = BamReader::new(registry, DataSource::Memory(bytes))?;
    reader.read_object()?;
    match reader.resolve() {
        Err(BamError::DanglingReferences(refs)) => {
            assert_eq!(refs.len(), 1);
            assert_eq!(refs[0].requester, ObjectId::new(1));
            assert_eq!(refs[0].requester_type, "Node");
            assert_eq!(refs[0].target, ObjectId::new(7));
        }
        other => panic!("expected dangling references, got {other:?}"),
    }
    Ok(())
}

#[test]
fn truncated_record_is_an_underrun() -> bamcode::Result<()> {
    let registry = registry();
    let mut stream = StreamBuilder::new();
    let mut record = stream.record(BamObjectCode::Push);
    define_type(&mut record, 2, "Node", Parent::Root { index: 1, first: true });
    record.add_u32(1);
    // A string length with no bytes behind it.
    record.add_u32(64);
    stream.frame(&record).pop();

    let mut reader = BamReader::new(registry, DataSource::Memory(stream.finish()))?;
    let err = reader.read_object().err();
    assert!(matches!(err, Some(BamError::DecodeUnderrun { wanted: 64, .. })));
    assert!(err.is_some_and(|e| e.is_corruption()));
    Ok(())
}

#[test]
fn group_left_open_is_a_format_error() -> bamcode::Result<()> {
    let registry = registry();
    let mut stream = StreamBuilder::new();
    let mut record = stream.record(BamObjectCode::Push);
    define_type(&mut record, 2, "Node", Parent::Root { index: 1, first: true });
    record.add_u32(1);
    record.add_string("open")?;
    record.add_u32(0);
    stream.frame(&record);

    let mut reader = BamReader::new(registry, DataSource::Memory(stream.finish()))?;
    assert!(matches!(reader.read_object(), Err(BamError::Format(_))));
    Ok(())
}

fn type_chain_stream(depth: u16, keep: usize) -> bamcode::Result<Vec<u8>> {
    let mut stream = StreamBuilder::new();
    let mut record = stream.record(BamObjectCode::Push);
    // Type 1 derives from type 2, which derives from type 3, and so on.
    record.add_u16(1);
    for index in 1..=depth {
        record.add_string(&format!("Layer{index}"))?;
        if index < depth {
            record.add_u8(1);
            record.add_u16(index + 1);
        } else {
            record.add_u8(0);
        }
    }
    record.add_u32(1);
    let mut cut = bamcode::Datagram::new(bamcode::BamEndian::Little, false);
    cut.append_data(&record.as_bytes()[..keep.min(record.len())]);
    stream.frame(&cut).pop();
    Ok(stream.finish())
}

#[test]
fn long_type_chains_are_read_without_recursion() -> bamcode::Result<()> {
    let registry = registry();
    let bytes = type_chain_stream(60_000, usize::MAX)?;

    let mut reader = BamReader::new(Arc::clone(&registry), DataSource::Memory(bytes.clone()))?;
    assert!(reader.read_object()?.is_none());
    assert_eq!(reader.skipped_records().len(), 1);
    assert_eq!(reader.skipped_records()[0].type_name, "Layer1");

    let report = BamInspector::inspect_bytes(&bytes)?;
    assert_eq!(report.types.len(), 60_000);
    assert_eq!(report.groups[0].root.type_name.as_deref(), Some("Layer1"));

    let truncated = type_chain_stream(60_000, 300_000)?;
    let mut reader = BamReader::new(Arc::clone(&registry), DataSource::Memory(truncated.clone()))?;
    assert!(reader.read_object().is_err_and(|e| e.is_corruption()));
    assert!(BamInspector::inspect_bytes(&truncated).is_err_and(|e| e.is_corruption()));
    Ok(())
}

#[test]
fn an_id_defined_twice_is_a_format_error() -> bamcode::Result<()> {
    let registry = registry();
    let mut stream = StreamBuilder::new();
    let mut first = stream.record(BamObjectCode::Push);
    define_type(&mut first, 2, "Node", Parent::Root { index: 1, first: true });
    first.add_u32(1);
    first.add_string("original")?;
    first.add_u32(0);
    stream.frame(&first).pop();

    let mut again = stream.record(BamObjectCode::Push);
    again.add_u16(2);
    again.add_u32(1);
    again.add_string("replacement")?;
    again.add_u32(0);
    stream.frame(&again).pop();

    let mut reader = BamReader::new(registry, DataSource::Memory(stream.finish()))?;
    let first = reader.read_object()?.ok_or_else(|| BamError::Logic("empty".into()))?;
    assert!(matches!(reader.read_object(), Err(BamError::Format(msg)) if msg.contains("defined twice")));
    assert_eq!(label(&first), "original");
    Ok(())
}

#[test]
fn adjunct_outside_a_group_is_a_format_error() -> bamcode::Result<()> {
    let registry = registry();
    let mut stream = StreamBuilder::new();
    let mut stray = stream.record(BamObjectCode::Adjunct);
    define_type(&mut stray, 2, "Node", Parent::Root { index: 1, first: true });
    stray.add_u32(1);
    stray.add_string("stray")?;
    stray.add_u32(0);
    stream.frame(&stray);
    let bytes = stream.finish();

    let mut reader = BamReader::new(registry, DataSource::Memory(bytes.clone()))?;
    assert!(matches!(reader.read_object(), Err(BamError::Format(msg)) if msg.contains("outside a group")));
    assert!(matches!(BamInspector::inspect_bytes(&bytes), Err(BamError::Format(_))));
    Ok(())
}

#[test]
fn file_round_trip_through_memory_map() -> bamcode::Result<()> {
    init_tracing();
    let registry = registry();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("chain.bam");

    let head = node("head");
    let tail = node("tail");
    link(&head, Some(&tail))?;
    Bam::save(&path, &registry, &head)?;

    let loaded = Bam::load(&path, &registry)?;
    assert_eq!(label(&loaded), "head");
    assert_eq!(next(&loaded).map(|n| label(&n)).as_deref(), Some("tail"));

    let report = BamInspector::inspect(&path)?;
    assert_eq!(report.file_size, std::fs::metadata(&path)?.len());
    Ok(())
}
