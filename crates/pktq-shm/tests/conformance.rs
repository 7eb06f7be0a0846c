//! Conformance scenarios from pktq-testkit, run against every backing.

use pktq_shm::{Backing, QueueConfig};
use pktq_testkit::{BackingFactory, TestError};

struct AnonymousFactory;

impl BackingFactory for AnonymousFactory {
    type Guard = ();

    fn configure(base: QueueConfig) -> Result<(QueueConfig, ()), TestError> {
        Ok((
            QueueConfig {
                backing: Backing::Anonymous,
                ..base
            },
            (),
        ))
    }
}

struct SharedFileFactory;

impl BackingFactory for SharedFileFactory {
    type Guard = tempfile::TempDir;

    fn configure(base: QueueConfig) -> Result<(QueueConfig, tempfile::TempDir), TestError> {
        let dir = tempfile::tempdir().map_err(|e| TestError::Setup(e.to_string()))?;
        let path = dir.path().join("pktq-region");
        Ok((
            QueueConfig {
                backing: Backing::Shared { path },
                ..base
            },
            dir,
        ))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

macro_rules! conformance {
    ($factory:ty, $($name:ident => $scenario:ident),* $(,)?) => {
        $(
            #[test]
            fn $name() {
                init_tracing();
                pktq_testkit::$scenario::<$factory>();
            }
        )*
    };
}

mod anonymous {
    use super::*;

    conformance!(AnonymousFactory,
        enable_disable_roundtrip => run_enable_disable_roundtrip,
        batch_overflow => run_batch_overflow,
        two_producers_small_queue => run_two_producers_small_queue,
        concurrent_producers_consumer => run_concurrent_producers_consumer,
        stale_slots_invisible => run_stale_slots_invisible,
        metadata_preserved => run_metadata_preserved,
        disable_under_load => run_disable_under_load,
    );
}

mod shared_file {
    use super::*;

    conformance!(SharedFileFactory,
        enable_disable_roundtrip => run_enable_disable_roundtrip,
        batch_overflow => run_batch_overflow,
        two_producers_small_queue => run_two_producers_small_queue,
        concurrent_producers_consumer => run_concurrent_producers_consumer,
        stale_slots_invisible => run_stale_slots_invisible,
        metadata_preserved => run_metadata_preserved,
        disable_under_load => run_disable_under_load,
    );
}
