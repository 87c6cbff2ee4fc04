use super::*;
use crate::logmath::LogMath;

fn node(word: WordId, text: &str, sf: usize, ef: usize, kind: NodeKind) -> LatticeNode {
    LatticeNode {
        word,
        text: text.to_string(),
        start_frame: sf,
        end_frame: ef,
        kind,
    }
}

fn nodes() -> Vec<LatticeNode> {
    vec![
        node(0, "<s>", 0, 0, NodeKind::Start),
        node(2, "A", 0, 1, NodeKind::Word),
        node(3, "B", 0, 1, NodeKind::Word),
        node(4, "C", 2, 3, NodeKind::Word),
        node(5, "D", 2, 3, NodeKind::Word),
        node(1, "</s>", 4, 4, NodeKind::End),
    ]
}

fn arcs() -> Vec<LatticeArc> {
    [
        (0, 1, -10, -1),
        (0, 2, -12, -1),
        (1, 3, -5, -2),
        (1, 4, -6, -2),
        (2, 3, -5, -1),
        (2, 4, -4, -1),
        (3, 5, 0, -1),
        (4, 5, 0, -3),
    ]
    .into_iter()
    .map(|(f, t, a, l)| LatticeArc::new(f, t, a * 1000, l * 1000))
    .collect()
}

fn diamond() -> Lattice {
    Lattice::from_parts("utt", 4, nodes(), arcs()).unwrap()
}

#[test]
fn best_path_takes_highest_total() {
    let lattice = diamond();
    let best = lattice.best_path().unwrap();
    assert_eq!(best.nodes, vec![0, 1, 3, 5]);
    assert_eq!(best.score, -19_000);
    assert_eq!(best.text(&lattice), "A C");
}

#[test]
fn equal_paths_resolve_to_the_earlier_arc() {
    let nodes = vec![
        node(0, "<s>", 0, 0, NodeKind::Start),
        node(2, "A", 0, 1, NodeKind::Word),
        node(3, "B", 0, 1, NodeKind::Word),
        node(4, "C", 2, 3, NodeKind::Word),
        node(1, "</s>", 4, 4, NodeKind::End),
    ];
    let build = |into_c: [(usize, usize); 2]| {
        let mut arcs = vec![LatticeArc::new(0, 1, -10, -1), LatticeArc::new(0, 2, -10, -1)];
        arcs.extend(into_c.iter().map(|&(f, t)| LatticeArc::new(f, t, -5, -1)));
        arcs.push(LatticeArc::new(3, 4, 0, -1));
        Lattice::from_parts("tie", 4, nodes.clone(), arcs).unwrap()
    };

    let b_first = build([(2, 3), (1, 3)]);
    assert_eq!(b_first.arc(2).from, 2);
    assert_eq!(b_first.best_path().unwrap().nodes, vec![0, 2, 3, 4]);

    let a_first = build([(1, 3), (2, 3)]);
    assert_eq!(a_first.best_path().unwrap().nodes, vec![0, 1, 3, 4]);
}

#[test]
fn nbest_enumerates_all_paths_in_order() {
    let lattice = diamond();
    let paths = lattice.nbest(10).unwrap();
    let scores: Vec<Score> = paths.iter().map(|p| p.score).collect();
    assert_eq!(scores, vec![-19_000, -20_000, -21_000, -22_000]);
    let texts: Vec<String> = paths.iter().map(|p| p.text(&lattice)).collect();
    assert_eq!(texts, vec!["A C", "B C", "B D", "A D"]);
    assert_eq!(paths[0], lattice.best_path().unwrap());
}

#[test]
fn posteriors_sum_to_one_across_cuts() {
    let mut lattice = diamond();
    let lmath = LogMath::default();
    lattice.compute_posteriors(&lmath, 1.0).unwrap();
    assert!(lattice.has_posteriors());

    let mass = |arcs: &[usize]| -> f64 {
        arcs.iter()
            .map(|&a| lattice.arc(a).posterior.exp())
            .sum::<f64>()
    };
    assert!((mass(lattice.out_arcs(lattice.start())) - 1.0).abs() < 1e-9);
    assert!((mass(lattice.in_arcs(lattice.end())) - 1.0).abs() < 1e-9);

    for frame in 0..4 {
        let total: f64 = (0..lattice.nodes().len())
            .filter(|&n| {
                let node = lattice.node(n);
                node.kind == NodeKind::Word && node.start_frame <= frame && frame <= node.end_frame
            })
            .map(|n| lattice.node_posterior(n).unwrap().exp())
            .sum();
        assert!((total - 1.0).abs() < 1e-9, "frame {frame}: {total}");
    }

    // A C is the most likely path, so A outweighs B.
    assert!(lattice.node_posterior(1).unwrap() > lattice.node_posterior(2).unwrap());
    let arc = lattice.arc(0);
    assert_eq!(arc.alpha, 0.0);
    assert!(arc.beta < 0.0);
}

#[test]
fn pruning_keeps_best_path() {
    let mut lattice = diamond();
    assert!(lattice.prune_by_posterior(-1.0).is_err());

    let lmath = LogMath::default();
    lattice.compute_posteriors(&lmath, 1.0).unwrap();
    let removed = lattice.prune_by_posterior(0.0).unwrap();
    assert_eq!(removed, 5);
    assert!(!lattice.has_posteriors());
    let texts: Vec<&str> = lattice.nodes().iter().map(|n| n.text.as_str()).collect();
    assert_eq!(texts, vec!["<s>", "A", "C", "</s>"]);
    assert_eq!(lattice.best_path().unwrap().score, -19_000);
}

#[test]
fn lenient_pruning_keeps_everything() {
    let mut lattice = diamond();
    lattice
        .compute_posteriors(&LogMath::default(), 1.0)
        .unwrap();
    assert_eq!(lattice.prune_by_posterior(f64::NEG_INFINITY).unwrap(), 0);
    assert_eq!(lattice.arcs().len(), 8);
}

#[test]
fn dead_ends_are_dropped() {
    let mut nodes = nodes();
    nodes.insert(3, node(6, "E", 2, 2, NodeKind::Word));
    let mut arcs: Vec<LatticeArc> = arcs()
        .into_iter()
        .map(|mut a| {
            if a.from >= 3 {
                a.from += 1;
            }
            if a.to >= 3 {
                a.to += 1;
            }
            a
        })
        .collect();
    arcs.push(LatticeArc::new(1, 3, -1, -1));
    let lattice = Lattice::from_parts("utt", 4, nodes, arcs).unwrap();
    assert_eq!(lattice.nodes().len(), 6);
    assert!(lattice.nodes().iter().all(|n| n.text != "E"));
    assert_eq!(lattice, diamond());
}

#[test]
fn rejects_non_adjacent_arcs() {
    let mut arcs = arcs();
    arcs.push(LatticeArc::new(0, 3, -1, -1));
    let err = Lattice::from_parts("utt", 4, nodes(), arcs).unwrap_err();
    assert!(matches!(err, DecoderError::InvariantViolation { .. }));
    assert!(err.is_fatal());
}

#[test]
fn rejects_missing_end() {
    let mut nodes = nodes();
    nodes[5].kind = NodeKind::Word;
    assert!(matches!(
        Lattice::from_parts("utt", 4, nodes, arcs()),
        Err(DecoderError::CorruptLattice { .. })
    ));
}

#[test]
fn detects_cycles() {
    let mut arcs = arcs();
    arcs.push(LatticeArc::new(3, 1, -1, -1));
    let lattice = Lattice::assemble("utt", 4, nodes(), arcs).unwrap();
    assert!(matches!(
        lattice.validate(),
        Err(DecoderError::InvariantViolation { .. })
    ));
    let err = lattice.topological_order().unwrap_err();
    assert!(matches!(err, DecoderError::InvariantViolation { .. }));
    assert!(err.is_fatal());
    assert!(matches!(
        lattice.best_path(),
        Err(DecoderError::InvariantViolation { .. })
    ));
    assert!(lattice.nbest(3).is_err());
}

#[test]
fn text_form_round_trips() {
    let lattice = diamond();
    let text = lattice.to_text();
    assert!(text.starts_with(format::HEADER));
    assert!(text.contains("node 1 2 A 0 1 word"));
    assert!(text.contains("arc 0 1 -10000 -1000"));
    let back = Lattice::read_text(&text).unwrap();
    assert_eq!(back, lattice);
}

#[test]
fn malformed_text_reports_line() {
    let text = diamond().to_text();

    let bad_header = text.replacen(format::HEADER, "# something else", 1);
    assert!(matches!(
        Lattice::read_text(&bad_header),
        Err(DecoderError::LatticeFormat { line: 1, .. })
    ));

    let bad_arc = text.replacen("arc 0 1 -10000 -1000", "arc 0 1 x -1000", 1);
    let line = bad_arc
        .lines()
        .position(|l| l.starts_with("arc 0 1 x"))
        .unwrap()
        + 1;
    match Lattice::read_text(&bad_arc) {
        Err(DecoderError::LatticeFormat { line: got, .. }) => assert_eq!(got, line),
        other => panic!("expected a format error, got {other:?}"),
    }

    let truncated: String = text.lines().take(5).collect::<Vec<_>>().join("\n");
    assert!(matches!(
        Lattice::read_text(&truncated),
        Err(DecoderError::LatticeFormat { .. })
    ));

    let trailing = format!("{text}arc 0 1 0 0\n");
    assert!(Lattice::read_text(&trailing).is_err());
}
