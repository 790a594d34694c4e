use nn_scheduler::{
    schedule, CpuTarget, DataType, Graph, MemoryRegion, OutputRef, ScheduleResult,
};

const F32: DataType = DataType::Float32;

fn run(graph: &mut Graph) -> ScheduleResult {
    schedule(graph, &CpuTarget::new()).expect("scheduling failed")
}

#[test]
fn single_add_assigns_regions_and_sequence() {
    let mut graph = Graph::new();
    let x = graph.add_input("x", F32, vec![1, 4]);
    let y = graph.add_constant("y", F32, vec![1, 4]);
    let add = graph.add_compute("add", "Add", &[x, y], F32, vec![1, 4]);
    graph.add_output("out", add);

    let result = run(&mut graph);

    assert_eq!(result.compute_sequence, vec![add.node]);
    assert_eq!(result.allocations.len(), 3);
    assert_eq!(result.allocations[&x].region, MemoryRegion::Input);
    assert_eq!(result.allocations[&y].region, MemoryRegion::Rdata);
    assert_eq!(result.allocations[&add].region, MemoryRegion::Output);

    let add_alloc = &result.allocations[&add];
    assert_eq!(add_alloc.shape, vec![1, 4]);
    assert_eq!(add_alloc.parent_shape, vec![1, 4]);
    assert_eq!(add_alloc.strides, vec![4, 1]);
    assert_eq!(add_alloc.size_bytes, 16);
    assert_eq!(add_alloc.start_byte, 0);

    assert_eq!(result.max_usages[&MemoryRegion::Input], 16);
    assert_eq!(result.max_usages[&MemoryRegion::Rdata], 16);
    assert_eq!(result.max_usages[&MemoryRegion::Output], 16);
    assert_eq!(result.max_usages[&MemoryRegion::Data], 0);
}

#[test]
fn bitcast_into_output_folds_and_promotes_its_producer() {
    let mut graph = Graph::new();
    let x = graph.add_input("x", F32, vec![1, 2, 2]);
    let add = graph.add_compute("add", "Add", &[x], F32, vec![1, 2, 2]);
    let cast = graph.add_bitcast("cast", add, vec![1, 4]);
    graph.add_output("out", cast);

    let result = run(&mut graph);

    // The bitcast does no runtime work.
    assert_eq!(result.compute_sequence, vec![add.node]);

    // Its producer now writes straight into the output region.
    let add_alloc = &result.allocations[&add];
    assert_eq!(add_alloc.region, MemoryRegion::Output);
    assert_eq!(add_alloc.shape, vec![1, 2, 2]);
    assert_eq!(add_alloc.parent_shape, vec![1, 2, 2]);

    // The bitcast view shares the same bytes but is indexed in its own shape.
    let cast_alloc = &result.allocations[&cast];
    assert_eq!(cast_alloc.region, MemoryRegion::Output);
    assert_eq!(cast_alloc.shape, vec![1, 4]);
    assert_eq!(cast_alloc.parent_shape, vec![1, 4]);
    assert_eq!(cast_alloc.start_byte, add_alloc.start_byte);

    assert_eq!(result.max_usages[&MemoryRegion::Data], 0);
}

#[test]
fn bitcast_from_constant_into_output_keeps_executing() {
    let mut graph = Graph::new();
    let w = graph.add_constant("w", F32, vec![2, 2]);
    let cast = graph.add_bitcast("cast", w, vec![4]);
    graph.add_output("out", cast);

    let result = run(&mut graph);

    // Rdata must be physically copied into the output region.
    assert_eq!(result.compute_sequence, vec![cast.node]);
    assert_eq!(result.allocations[&w].region, MemoryRegion::Rdata);
    assert_eq!(result.allocations[&cast].region, MemoryRegion::Output);
}

#[test]
fn concat_along_outer_axis_aliases_inputs_into_output() {
    let mut graph = Graph::new();
    let a_in = graph.add_input("a_in", F32, vec![2, 3]);
    let b_in = graph.add_input("b_in", F32, vec![3, 3]);
    let a = graph.add_compute("add_a", "Add", &[a_in], F32, vec![2, 3]);
    let b = graph.add_compute("add_b", "Add", &[b_in], F32, vec![3, 3]);
    let cat = graph.add_concat("cat", 0, &[a, b]).unwrap();
    graph.add_output("out", cat);

    let result = run(&mut graph);

    assert_eq!(result.compute_sequence, vec![a.node, b.node]);

    let cat_alloc = &result.allocations[&cat];
    assert_eq!(cat_alloc.region, MemoryRegion::Output);
    assert_eq!(cat_alloc.shape, vec![5, 3]);

    // Both adds write into the concat's storage at their prefix offsets.
    let a_alloc = &result.allocations[&a];
    assert_eq!(a_alloc.region, MemoryRegion::Output);
    assert_eq!(a_alloc.parent_shape, vec![5, 3]);
    assert_eq!(a_alloc.strides, vec![3, 1]);
    assert_eq!(a_alloc.start_byte, cat_alloc.start_byte);

    let b_alloc = &result.allocations[&b];
    assert_eq!(b_alloc.parent_shape, vec![5, 3]);
    assert_eq!(b_alloc.start_byte, cat_alloc.start_byte + 4 * 2 * 3);

    // Nothing is left in scratch memory.
    assert_eq!(result.max_usages[&MemoryRegion::Data], 0);
    assert_eq!(result.max_usages[&MemoryRegion::Output], 4 * 5 * 3);
}

#[test]
fn concat_chain_collapses_to_one_buffer() {
    let mut graph = Graph::new();
    let mut leaves = Vec::new();
    for i in 0..4 {
        let input = graph.add_input(format!("in{i}"), F32, vec![1, 4]);
        leaves.push(graph.add_compute(format!("add{i}"), "Add", &[input], F32, vec![1, 4]));
    }
    let c1 = graph.add_concat("c1", 0, &[leaves[0], leaves[1]]).unwrap();
    let c2 = graph.add_concat("c2", 0, &[c1, leaves[2]]).unwrap();
    let c3 = graph.add_concat("c3", 0, &[c2, leaves[3]]).unwrap();
    graph.add_output("out", c3);

    let result = run(&mut graph);

    // All three concats fold away.
    assert_eq!(
        result.compute_sequence,
        leaves.iter().map(|leaf| leaf.node).collect::<Vec<_>>()
    );

    // Leaf offsets are the prefix sums of the chain, all inside one root.
    let row_bytes = 4 * 4;
    let root_start = result.allocations[&c3].start_byte;
    for (i, leaf) in leaves.iter().enumerate() {
        let alloc = &result.allocations[leaf];
        assert_eq!(alloc.region, MemoryRegion::Output);
        assert_eq!(alloc.parent_shape, vec![4, 4]);
        assert_eq!(alloc.start_byte, root_start + i * row_bytes);
    }

    // Collapsed intermediates sit at the root's origin.
    assert_eq!(result.allocations[&c1].start_byte, root_start);
    assert_eq!(result.allocations[&c2].start_byte, root_start);

    // One physical buffer backs the whole chain.
    assert_eq!(result.max_usages[&MemoryRegion::Output], 4 * row_bytes);
    assert_eq!(result.max_usages[&MemoryRegion::Data], 0);
}

#[test]
fn concat_along_inner_axis_keeps_executing() {
    let mut graph = Graph::new();
    let a_in = graph.add_input("a_in", F32, vec![2, 3]);
    let b_in = graph.add_input("b_in", F32, vec![2, 3]);
    let a = graph.add_compute("add_a", "Add", &[a_in], F32, vec![2, 3]);
    let b = graph.add_compute("add_b", "Add", &[b_in], F32, vec![2, 3]);
    let cat = graph.add_concat("cat", 1, &[a, b]).unwrap();
    graph.add_output("out", cat);

    let result = run(&mut graph);

    // Axis 1 with a leading dimension of 2 is not a plain byte-append.
    assert_eq!(result.compute_sequence, vec![a.node, b.node, cat.node]);
    assert_eq!(result.allocations[&cat].shape, vec![2, 6]);

    // The inputs stay independent scratch buffers with disjoint placements.
    let a_alloc = &result.allocations[&a];
    let b_alloc = &result.allocations[&b];
    assert_eq!(a_alloc.region, MemoryRegion::Data);
    assert_eq!(b_alloc.region, MemoryRegion::Data);
    assert_eq!(a_alloc.parent_shape, vec![2, 3]);
    assert_eq!(b_alloc.parent_shape, vec![2, 3]);
    assert!(
        a_alloc.start_byte + a_alloc.size_bytes <= b_alloc.start_byte
            || b_alloc.start_byte + b_alloc.size_bytes <= a_alloc.start_byte
    );
    assert_eq!(result.max_usages[&MemoryRegion::Data], 48);
}

#[test]
fn lifetime_union_keeps_aliased_storage_out_of_reuse() {
    let mut graph = Graph::new();
    let x = graph.add_input("x", F32, vec![1, 4]);

    // A producer whose only direct consumer is a folded bitcast.
    let p = graph.add_compute("p", "Relu", &[x], F32, vec![1, 4]);
    let view = graph.add_bitcast("view", p, vec![4]);

    // A chain of short-lived scratch buffers ticking the clock past the
    // bitcast before anything reads the view.
    let mut q = graph.add_compute("q0", "Relu", &[x], F32, vec![1, 4]);
    let mut scratch = vec![q];
    for i in 1..5 {
        q = graph.add_compute(format!("q{i}"), "Relu", &[q], F32, vec![1, 4]);
        scratch.push(q);
    }
    let last = graph.add_compute("join", "Add", &[view, q], F32, vec![1, 4]);
    graph.add_output("out", last);

    let result = run(&mut graph);

    // The view aliases p's storage at the same start.
    let p_alloc = &result.allocations[&p];
    assert_eq!(p_alloc.region, MemoryRegion::Data);
    assert_eq!(result.allocations[&view].start_byte, p_alloc.start_byte);

    // p's storage is held until the join reads the view, so none of the
    // scratch buffers may reuse its bytes.
    for conn in &scratch {
        let alloc = &result.allocations[conn];
        assert!(
            alloc.start_byte >= p_alloc.start_byte + p_alloc.size_bytes,
            "scratch buffer reused widened storage at byte {}",
            alloc.start_byte
        );
    }

    // Root plus two live scratch rows at the peak.
    assert_eq!(result.max_usages[&MemoryRegion::Data], 48);
}

#[test]
fn overlapping_scratch_buffers_get_disjoint_ranges() {
    let mut graph = Graph::new();
    let x = graph.add_input("x", F32, vec![1, 16]);
    let a = graph.add_compute("a", "Relu", &[x], F32, vec![1, 16]);
    let b = graph.add_compute("b", "Sigmoid", &[x], F32, vec![1, 16]);
    let c = graph.add_compute("c", "Add", &[a, b], F32, vec![1, 16]);
    let d = graph.add_compute("d", "Relu", &[c], F32, vec![1, 16]);
    let e = graph.add_compute("e", "Add", &[c, d], F32, vec![1, 16]);
    graph.add_output("out", e);

    let result = run(&mut graph);

    let disjoint = |lhs: OutputRef, rhs: OutputRef| {
        let l = &result.allocations[&lhs];
        let r = &result.allocations[&rhs];
        l.start_byte + l.size_bytes <= r.start_byte || r.start_byte + r.size_bytes <= l.start_byte
    };

    // a and b are both live until c executes; c and d until e executes.
    assert!(disjoint(a, b));
    assert!(disjoint(c, d));
}

#[test]
fn scheduling_is_deterministic() {
    let build = || {
        let mut graph = Graph::new();
        let mut leaves = Vec::new();
        for i in 0..3 {
            let input = graph.add_input(format!("in{i}"), F32, vec![2, 4]);
            leaves.push(graph.add_compute(format!("add{i}"), "Add", &[input], F32, vec![2, 4]));
        }
        let c1 = graph.add_concat("c1", 0, &[leaves[0], leaves[1]]).unwrap();
        let c2 = graph.add_concat("c2", 0, &[c1, leaves[2]]).unwrap();
        graph.add_output("out", c2);
        graph
    };

    let first = run(&mut build());
    let second = run(&mut build());
    assert_eq!(first, second);
}

#[test]
fn removing_a_folded_bitcast_leaves_the_schedule_unchanged() {
    // With the reshape in place.
    let mut with_cast = Graph::new();
    let x1 = with_cast.add_input("x", F32, vec![1, 2, 2]);
    let add1 = with_cast.add_compute("add", "Add", &[x1], F32, vec![1, 2, 2]);
    let cast = with_cast.add_bitcast("cast", add1, vec![1, 4]);
    with_cast.add_output("out", cast);

    // Same graph with the producer wired straight to the output.
    let mut without_cast = Graph::new();
    let x2 = without_cast.add_input("x", F32, vec![1, 2, 2]);
    let add2 = without_cast.add_compute("add", "Add", &[x2], F32, vec![1, 2, 2]);
    without_cast.add_output("out", add2);

    let first = run(&mut with_cast);
    let second = run(&mut without_cast);

    assert_eq!(first.compute_sequence, second.compute_sequence);
    assert_eq!(
        first.allocations[&x1].start_byte,
        second.allocations[&x2].start_byte
    );
    assert_eq!(
        first.allocations[&add1].start_byte,
        second.allocations[&add2].start_byte
    );
    assert_eq!(first.max_usages, second.max_usages);
}

#[test]
fn schedule_summary_serializes_to_json() -> anyhow::Result<()> {
    let mut graph = Graph::new();
    let x = graph.add_input("x", F32, vec![1, 4]);
    let y = graph.add_constant("y", F32, vec![1, 4]);
    let add = graph.add_compute("add", "Add", &[x, y], F32, vec![1, 4]);
    graph.add_output("out", add);

    let result = run(&mut graph);
    let summary = result.summary(&graph);
    let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&summary)?)?;

    assert_eq!(json["compute_sequence"][0], "add");
    assert_eq!(json["allocations"].as_array().map(|a| a.len()), Some(3));
    assert_eq!(json["max_usages"].as_array().map(|a| a.len()), Some(4));
    Ok(())
}

#[test]
fn byte_size_overflow_is_an_unsupported_shape() {
    let mut graph = Graph::new();
    let x = graph.add_input("x", F32, vec![usize::MAX, 2]);
    let y = graph.add_compute("relu", "Relu", &[x], F32, vec![usize::MAX, 2]);
    graph.add_output("out", y);

    let err = schedule(&mut graph, &CpuTarget::new()).unwrap_err();
    assert!(matches!(err, nn_scheduler::Error::UnsupportedShape(_)));
}

#[test]
fn data_region_capacity_exhaustion_fails_the_schedule() {
    let mut graph = Graph::new();
    let x = graph.add_input("x", F32, vec![1, 16]);
    let a = graph.add_compute("a", "Relu", &[x], F32, vec![1, 16]);
    let b = graph.add_compute("b", "Sigmoid", &[x], F32, vec![1, 16]);
    let c = graph.add_compute("c", "Add", &[a, b], F32, vec![1, 16]);
    graph.add_output("out", c);

    // a and b are live together and need 128 bytes of scratch.
    let err = schedule(&mut graph, &CpuTarget::with_data_capacity(64)).unwrap_err();
    assert!(matches!(err, nn_scheduler::Error::AllocatorExhausted(_)));
}
