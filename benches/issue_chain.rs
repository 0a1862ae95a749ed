//! Issue-throughput benchmark: a straight-line chain of tasks writing
//! the same field, driven through analysis and commit inline.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use opstream::{
    CoherenceMode, FieldId, PrivilegeMode, RegionRequirement, Runtime, RuntimeConfig, TaskLauncher,
};

fn issue_chain(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("issue_chain");
    for &length in &[64usize, 256, 1024] {
        group.throughput(Throughput::Elements(length as u64));
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, &length| {
            b.iter(|| {
                let rt = Runtime::new(RuntimeConfig::inline()).expect("runtime");
                let ctx = rt.create_context("bench");
                let field = FieldId::new(0);
                let region = ctx.create_region(&[field]);
                for id in 0..length {
                    let requirement = RegionRequirement::new(
                        region,
                        region,
                        [field],
                        PrivilegeMode::ReadWrite,
                        CoherenceMode::Exclusive,
                    );
                    ctx.issue_task(TaskLauncher::new(id as u64).with_region(requirement))
                        .expect("task");
                }
                ctx.drain();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, issue_chain);
criterion_main!(benches);
