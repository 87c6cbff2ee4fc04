use ngram_decoder::lattice::{LatticeArc, LatticeNode, NodeKind};
use ngram_decoder::{Lattice, LogMath, Score};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SEEDS: u64 = 40;

/// Random lattice over `n_frames` frames. A chain of one-frame words keeps
/// the start and end connected; other words get random spans and arcs.
fn random_lattice(rng: &mut StdRng) -> Lattice {
    let n_frames = rng.gen_range(2..7);
    let mut nodes = vec![LatticeNode {
        word: 0,
        text: "<s>".to_string(),
        start_frame: 0,
        end_frame: 0,
        kind: NodeKind::Start,
    }];
    for f in 0..n_frames {
        nodes.push(word_node(nodes.len(), f, f, rng.gen_bool(0.2)));
    }
    for _ in 0..rng.gen_range(2..10) {
        let sf = rng.gen_range(0..n_frames);
        let ef = rng.gen_range(sf..n_frames);
        nodes.push(word_node(nodes.len(), sf, ef, rng.gen_bool(0.2)));
    }
    let end = nodes.len();
    nodes.push(LatticeNode {
        word: 1,
        text: "</s>".to_string(),
        start_frame: n_frames,
        end_frame: n_frames,
        kind: NodeKind::End,
    });

    let mut arcs = Vec::new();
    for to in 1..nodes.len() {
        for from in 0..end {
            let linked = if from == 0 {
                nodes[to].kind != NodeKind::End && nodes[to].start_frame == 0
            } else {
                nodes[from].end_frame + 1 == nodes[to].start_frame
            };
            let chain = (to <= n_frames && from + 1 == to) || (from == n_frames && to == end);
            if linked && (chain || rng.gen_bool(0.6)) {
                let ascr: Score = rng.gen_range(-3000..0);
                let lscr: Score = rng.gen_range(-2000..0);
                arcs.push(LatticeArc::new(from, to, ascr, lscr));
            }
        }
    }
    Lattice::from_parts("random", n_frames, nodes, arcs).expect("chain keeps the lattice connected")
}

fn word_node(id: usize, sf: usize, ef: usize, filler: bool) -> LatticeNode {
    LatticeNode {
        word: id + 1,
        text: if filler { format!("<f{id}>") } else { format!("W{id}") },
        start_frame: sf,
        end_frame: ef,
        kind: if filler { NodeKind::Filler } else { NodeKind::Word },
    }
}

/// Scores of every complete path, by exhaustive search.
fn all_path_scores(lattice: &Lattice) -> Vec<i64> {
    fn walk(lattice: &Lattice, node: usize, acc: i64, out: &mut Vec<i64>) {
        if node == lattice.end() {
            out.push(acc);
            return;
        }
        for &a in lattice.out_arcs(node) {
            let arc = lattice.arc(a);
            walk(lattice, arc.to, acc + arc.score() as i64, out);
        }
    }
    let mut out = Vec::new();
    walk(lattice, lattice.start(), 0, &mut out);
    out
}

#[test]
fn best_path_matches_exhaustive_search() {
    for seed in 0..SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let lattice = random_lattice(&mut rng);
        let best = lattice.best_path().unwrap();
        let expected = all_path_scores(&lattice).into_iter().max().unwrap();
        assert_eq!(best.score as i64, expected, "seed {seed}");
        assert_eq!(best.nodes.first(), Some(&lattice.start()));
        assert_eq!(best.nodes.last(), Some(&lattice.end()));
        assert_eq!(best.arcs.len() + 1, best.nodes.len());
    }
}

#[test]
fn nbest_enumerates_every_path_in_order() {
    for seed in 0..SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let lattice = random_lattice(&mut rng);
        let mut expected = all_path_scores(&lattice);
        expected.sort_unstable_by(|a, b| b.cmp(a));

        let paths = lattice.nbest(expected.len() + 5).unwrap();
        let scores: Vec<i64> = paths.iter().map(|p| p.score as i64).collect();
        assert_eq!(scores, expected, "seed {seed}");
        assert_eq!(paths[0].score, lattice.best_path().unwrap().score);

        let mut seen: Vec<&Vec<usize>> = paths.iter().map(|p| &p.nodes).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), paths.len(), "seed {seed}: repeated path");
    }
}

#[test]
fn posteriors_normalize_per_frame() {
    let logmath = LogMath::default();
    for seed in 0..SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut lattice = random_lattice(&mut rng);
        lattice.compute_posteriors(&logmath, 1.0).unwrap();

        for frame in 0..lattice.n_frames() {
            let mass: f64 = (0..lattice.nodes().len())
                .filter(|&n| {
                    let node = lattice.node(n);
                    matches!(node.kind, NodeKind::Word | NodeKind::Filler)
                        && node.start_frame <= frame
                        && frame <= node.end_frame
                })
                .map(|n| lattice.node_posterior(n).unwrap().exp())
                .sum();
            assert!((mass - 1.0).abs() < 1e-6, "seed {seed} frame {frame}: {mass}");
        }
        for arc in lattice.arcs() {
            assert!(arc.posterior <= 0.0);
        }
    }
}

#[test]
fn pruning_never_loses_the_best_path() {
    let logmath = LogMath::default();
    for seed in 0..SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut lattice = random_lattice(&mut rng);
        let best = lattice.best_path().unwrap();
        lattice.compute_posteriors(&logmath, 0.05).unwrap();
        lattice.prune_by_posterior((0.3f64).ln()).unwrap();
        lattice.validate().unwrap();
        let after = lattice.best_path().unwrap();
        assert_eq!(after.score, best.score, "seed {seed}");
    }
}

#[test]
fn text_form_round_trips_and_stays_acyclic() {
    for seed in 0..SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let lattice = random_lattice(&mut rng);
        let order = lattice.topological_order().unwrap();
        assert_eq!(order.len(), lattice.nodes().len());
        let back = Lattice::read_text(&lattice.to_text()).unwrap();
        assert_eq!(back, lattice, "seed {seed}");
    }
}
