use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rapl_lib::{
    config::{DomainSelection, ProbeType},
    sampling, DomainId, RaplDomainType, SamplingCore,
};
use rapl_probes::synthetic::SyntheticSource;

fn synthetic_core(domains: &[DomainId]) -> SamplingCore {
    let src = SyntheticSource::new(domains, 0, 1_000, u32::MAX as u64);
    SamplingCore::new(Box::new(src))
}

fn hardware_core(probe: ProbeType, domains: &[RaplDomainType]) -> Option<SamplingCore> {
    let selection = DomainSelection::Only(domains.to_vec());
    match sampling::open_source(probe, &selection) {
        Ok(source) => Some(SamplingCore::new(source)),
        Err(e) => {
            eprintln!("skipping the {probe} probe: {e}");
            None
        }
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let domains_lists: [(&str, &[RaplDomainType]); 3] = [
        ("1", &[RaplDomainType::Package]),
        ("2", &[RaplDomainType::Package, RaplDomainType::PP0]),
        ("3", &[RaplDomainType::Package, RaplDomainType::PP0, RaplDomainType::Dram]),
    ];

    // criterion config
    let mut group = c.benchmark_group("bracket");
    group
        .significance_level(0.01)
        .sample_size(1000)
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(10));

    for (id, domains) in domains_lists {
        // one begin/end cycle around an empty workload
        let mut run_bench = |name: &str, core: &mut SamplingCore| {
            let id = BenchmarkId::new(name, id);
            group.bench_function(id, |b| {
                b.iter(|| {
                    core.begin_session().unwrap();
                    black_box(core.end_session().unwrap());
                })
            });
        };

        let ids: Vec<DomainId> = domains.iter().map(|d| DomainId::new(0, *d)).collect();
        run_bench("synthetic", &mut synthetic_core(&ids));

        for probe in [ProbeType::PowercapSysfs, ProbeType::PerfEvent, ProbeType::Msr] {
            if let Some(mut core) = hardware_core(probe, domains) {
                run_bench(&probe.to_string(), &mut core);
            }
        }
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
