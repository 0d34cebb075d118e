//! Benchmark for container rebuilds
//!
//! Measures:
//! - Initialization from the store
//! - Add-then-remove of one rule over a loaded container
//! - Firing a session over the loaded rules

use std::sync::Arc;

use container::{ContainerConfig, InMemoryRuleRepository, RuleContainer, RuleDefinition, RuleId};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rule_engine::Fact;

fn generate_rule(i: usize) -> String {
    format!(
        r#"package bench.rules;

rule "discount {i}"
    salience {salience}
    no-loop
when
    $o : Order( total > {threshold}, tier == "gold" )
    not Blocked( orderId == $o.id )
then
    modify($o) {{ discount = $o.total * 0.0{pct} }};
end
"#,
        i = i,
        salience = i % 7,
        threshold = i * 10,
        pct = i % 9 + 1
    )
}

fn repository_with(num_rules: usize) -> Arc<InMemoryRuleRepository> {
    Arc::new(InMemoryRuleRepository::with_rules((0..num_rules).map(|i| {
        RuleDefinition::new(i as i64, format!("discount-{}", i), generate_rule(i))
    })))
}

fn bench_initialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("initialize");

    for num_rules in [10, 100, 500].iter() {
        let repo = repository_with(*num_rules);
        group.bench_with_input(BenchmarkId::from_parameter(num_rules), num_rules, |b, _| {
            b.iter(|| {
                let container = RuleContainer::new(repo.clone(), ContainerConfig::default());
                container.initialize().unwrap();
                black_box(container.loaded_rules_count())
            })
        });
    }

    group.finish();
}

fn bench_incremental_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_remove");

    for num_rules in [10, 100, 500].iter() {
        let repo = repository_with(*num_rules);
        let container = RuleContainer::new(repo, ContainerConfig::default());
        container.initialize().unwrap();
        let extra = RuleDefinition::new(-1, "extra", generate_rule(*num_rules));

        group.bench_with_input(BenchmarkId::from_parameter(num_rules), num_rules, |b, _| {
            b.iter(|| {
                container.add_rule(&extra).unwrap();
                container.remove_rule(RuleId(-1)).unwrap();
            })
        });
    }

    group.finish();
}

fn bench_fire(c: &mut Criterion) {
    let mut group = c.benchmark_group("fire_all_rules");

    for num_rules in [10, 100].iter() {
        let container = RuleContainer::new(repository_with(*num_rules), ContainerConfig::default());
        container.initialize().unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(num_rules), num_rules, |b, _| {
            b.iter(|| {
                let mut session = container.create_session().unwrap();
                for id in 0..20i64 {
                    session.insert(
                        Fact::new("bench.Order")
                            .with_field("id", id)
                            .with_field("total", id as f64 * 50.0)
                            .with_field("tier", "gold")
                            .with_field("discount", 0.0),
                    );
                }
                session.insert(Fact::new("bench.Blocked").with_field("orderId", 3i64));
                let fired = session.fire_all_rules().unwrap();
                session.dispose();
                black_box(fired)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_initialize, bench_incremental_update, bench_fire);
criterion_main!(benches);
