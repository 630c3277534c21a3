//! Multi-replica certification runs over generated streams

use proptest::prelude::*;

use certa_core::Seqno;
use certa_test::{
    FuzzerConfig, ReplicaFuzzer, StreamItem, WorkloadConfig, WorkloadGenerator,
};

#[test]
fn test_default_workload_converges() {
    let report = ReplicaFuzzer::new(FuzzerConfig::default()).run().unwrap();

    assert!(report.is_valid(), "{:?}", report.convergence);
    assert_eq!(report.certified + report.conflicts, 1000);
    assert!(report.certified > 0);
    assert!(report.purged > 0);
}

#[test]
fn test_hot_rows_conflict_and_converge() {
    let report = ReplicaFuzzer::new(FuzzerConfig::hot_rows()).run().unwrap();

    assert!(report.is_valid(), "{:?}", report.convergence);
    assert!(report.conflicts > 0);
    assert!(report.dependent > 0);
}

#[test]
fn test_serializable_converges() {
    let config = FuzzerConfig::hot_rows().serializable();
    let report = ReplicaFuzzer::new(config).run().unwrap();
    assert!(report.is_valid(), "{:?}", report.convergence);
}

#[test]
fn test_read_only_workload_never_conflicts() {
    let config = FuzzerConfig {
        workload: WorkloadConfig {
            write_prob: 0.0,
            ..WorkloadConfig::hot_rows()
        },
        ..FuzzerConfig::hot_rows()
    };
    let report = ReplicaFuzzer::new(config).run().unwrap();

    assert_eq!(report.conflicts, 0);
    assert_eq!(report.certified, 500);
}

#[test]
fn test_up_to_date_writers_never_conflict() {
    // Every source saw the whole stream before writing
    let config = FuzzerConfig {
        workload: WorkloadConfig {
            stale_prob: 0.0,
            unknown_prob: 0.0,
            ..WorkloadConfig::hot_rows()
        },
        ..FuzzerConfig::hot_rows()
    };
    let report = ReplicaFuzzer::new(config).run().unwrap();

    assert_eq!(report.conflicts, 0);
    assert!(report.dependent > 0);
}

#[test]
fn test_without_cuts_index_keeps_everything() {
    let config = FuzzerConfig {
        workload: WorkloadConfig {
            cut_interval: 0,
            ..WorkloadConfig::light()
        },
        ..FuzzerConfig::light()
    };
    let mut fuzzer = ReplicaFuzzer::new(config);
    let report = fuzzer.run().unwrap();

    assert_eq!(report.purged, 0);
    for replica in fuzzer.replicas() {
        assert_eq!(replica.certification().trx_map_len() as u64, report.certified);
        assert_eq!(replica.certification().position(), Seqno::new(200));
    }
}

#[test]
fn test_replicas_apply_at_different_paces() {
    let mut fuzzer = ReplicaFuzzer::new(FuzzerConfig::light());
    fuzzer.run().unwrap();

    // Drained at the end, so every certified trx got applied everywhere
    let certified = fuzzer.replicas()[0].certification().stats().certified;
    for replica in fuzzer.replicas() {
        assert_eq!(replica.applied(), certified);
    }
}

#[test]
fn test_stream_has_cuts() {
    let items = WorkloadGenerator::new(WorkloadConfig::hot_rows()).generate();
    assert!(items
        .iter()
        .any(|item| matches!(item, StreamItem::CommitCut(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_any_seed_converges(seed in any::<u64>(), serializable in any::<bool>()) {
        let mut config = FuzzerConfig::hot_rows().with_seed(seed);
        config.workload.trx_count = 200;
        if serializable {
            config = config.serializable();
        }

        let report = ReplicaFuzzer::new(config).run().unwrap();
        prop_assert!(report.is_valid());
        prop_assert_eq!(report.certified + report.conflicts, 200);
    }
}
