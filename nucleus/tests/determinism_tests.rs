//! Determinism tests: identical seeds and schedules must replay identically,
//! within a single simulation and across whole experiments.

use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use nucleus::{
    Experiment, FunctionalDimension, Plugin, Simulation, sim_random, sim_random_range,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A plugin whose plans draw from the thread-local RNG, so the output
/// sequence fingerprints the seed.
fn random_walk_plugin(steps: u64) -> Plugin {
    Plugin::builder("random-walk")
        .with_initializer(move |ctx| {
            for step in 0..steps {
                ctx.add_plan(step as f64, |actor| {
                    actor.release_output(sim_random::<u64>())
                })?;
            }
            Ok(())
        })
        .build()
}

fn run_seeded(seed: u64) -> Vec<u64> {
    let mut sim = Simulation::builder()
        .add_plugin(random_walk_plugin(16))
        .seed(seed)
        .build();
    sim.run().unwrap();
    sim.take_output()
        .into_iter()
        .map(|item| *item.downcast::<u64>().unwrap())
        .collect()
}

#[test]
fn same_seed_replays_the_same_output_sequence() {
    init_tracing();
    let first = run_seeded(42);
    assert_eq!(first.len(), 16);
    for _ in 0..5 {
        assert_eq!(run_seeded(42), first);
    }
}

#[test]
fn different_seeds_produce_different_sequences() {
    assert_ne!(run_seeded(1), run_seeded(2));
}

#[test]
fn interleaved_scheduling_replays_identically() {
    fn run() -> Vec<String> {
        let mut sim = Simulation::builder()
            .add_plugin(
                Plugin::builder("interleaver")
                    .with_initializer(|ctx| {
                        ctx.add_plan(2.0, |actor| {
                            actor.release_output("init@2".to_string())
                        })?;
                        ctx.add_plan(1.0, |actor| {
                            // Scheduled while running: lands at the same time
                            // as init@2 but after it in arrival order.
                            actor.add_plan(2.0, |actor| {
                                actor.release_output("plan@2".to_string())
                            })?;
                            let delay = sim_random_range(3.0..4.0);
                            actor.add_plan(delay, move |actor| {
                                actor.release_output(format!("random@{delay:.3}"))
                            })?;
                            actor.release_output("init@1".to_string())
                        })?;
                        Ok(())
                    })
                    .build(),
            )
            .seed(7)
            .build();
        sim.run().unwrap();
        sim.take_output()
            .into_iter()
            .map(|item| *item.downcast::<String>().unwrap())
            .collect()
    }

    let first = run();
    assert_eq!(first[0], "init@1");
    assert_eq!(first[1], "init@2");
    assert_eq!(first[2], "plan@2");
    assert!(first[3].starts_with("random@3."));
    for _ in 0..5 {
        assert_eq!(run(), first);
    }
}

fn run_experiment(base_seed: u64, threads: usize) -> (BTreeMap<usize, Vec<u64>>, Vec<u64>) {
    let outputs: Rc<RefCell<BTreeMap<usize, Vec<u64>>>> =
        Rc::new(RefCell::new(BTreeMap::new()));

    let mut dimension = FunctionalDimension::new(["variant"]);
    for level in 0..3 {
        dimension = dimension.with_level(move |_| Ok(vec![format!("variant={level}")]));
    }

    let collector = outputs.clone();
    let report = Experiment::builder()
        .add_plugin(random_walk_plugin(8))
        .add_dimension(dimension)
        .base_seed(base_seed)
        .thread_count(threads)
        .subscribe_to_output::<u64>(move |_, scenario, &value| {
            collector.borrow_mut().entry(scenario).or_default().push(value);
            Ok(())
        })
        .execute()
        .unwrap();

    assert!(report.is_success());
    let seeds = report.outcomes().iter().map(|o| o.seed).collect();
    (Rc::into_inner(outputs).unwrap().into_inner(), seeds)
}

#[test]
fn experiment_reruns_reproduce_every_scenario() {
    let (first_outputs, first_seeds) = run_experiment(99, 1);
    assert_eq!(first_outputs.len(), 3);
    for values in first_outputs.values() {
        assert_eq!(values.len(), 8);
    }

    let (rerun_outputs, rerun_seeds) = run_experiment(99, 1);
    assert_eq!(rerun_outputs, first_outputs);
    assert_eq!(rerun_seeds, first_seeds);
}

#[test]
fn concurrency_does_not_change_scenario_results() {
    let (sequential, seeds_sequential) = run_experiment(123, 1);
    let (concurrent, seeds_concurrent) = run_experiment(123, 3);
    assert_eq!(sequential, concurrent);
    assert_eq!(seeds_sequential, seeds_concurrent);
}

#[test]
fn scenarios_with_distinct_seeds_diverge() {
    let (outputs, seeds) = run_experiment(5, 1);
    assert_eq!(seeds.len(), 3);
    assert_ne!(outputs[&0], outputs[&1]);
    assert_ne!(outputs[&1], outputs[&2]);
}
