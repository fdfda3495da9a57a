//! Property tests for part assembly

use std::sync::Arc;

use proptest::prelude::*;
use s3stream_core::storage::{InMemoryObjectStore, S3FileSystem, WriterConfig};
use s3stream_core::{ExecutorConfig, FileBufferPool, PoolConfig, UploadExecutor};

const PART: usize = 16;

/// Write `chunks` as one appendv per chunk and return the stored object and its part sizes
fn write_chunks(chunks: &[Vec<u8>]) -> (Vec<u8>, Vec<usize>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let store = Arc::new(InMemoryObjectStore::with_min_part_size(PART));
        let pool = FileBufferPool::new(PoolConfig {
            buffer_size: PART,
            max_buffers: 4,
        })
        .unwrap();
        let executor = UploadExecutor::new(ExecutorConfig {
            workers: 2,
            thread_name: "prop-upload".into(),
        })
        .unwrap();
        let config = WriterConfig {
            min_part_size: PART,
            ..Default::default()
        };
        let fs = S3FileSystem::new(store.clone(), "memory://", "b", pool, executor, config).unwrap();

        let mut writer = fs.create_file("k");
        for chunk in chunks {
            writer.appendv(&[chunk]).await.unwrap();
        }
        writer.close().await.unwrap();

        (
            store.object("b", "k").unwrap().to_vec(),
            store.object_part_sizes("b", "k").unwrap(),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn props_object_equals_appended_bytes(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..50), 0..10)
    ) {
        let expected: Vec<u8> = chunks.concat();
        let (object, _) = write_chunks(&chunks);
        prop_assert_eq!(object, expected);
    }

    #[test]
    fn props_parts_are_full_except_last(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..40), 1..10)
    ) {
        let n: usize = chunks.iter().map(|c| c.len()).sum();
        let (object, sizes) = write_chunks(&chunks);

        prop_assert_eq!(object.len(), n);
        prop_assert_eq!(sizes.len(), n.div_ceil(PART));
        let (last, full) = sizes.split_last().unwrap();
        prop_assert!(full.iter().all(|&s| s == PART));
        let expected_last = if n % PART == 0 { PART } else { n % PART };
        prop_assert_eq!(*last, expected_last);
    }

    #[test]
    fn props_single_append_round_trips(data in prop::collection::vec(any::<u8>(), 1..=PART)) {
        let (object, sizes) = write_chunks(&[data.clone()]);
        prop_assert_eq!(object, data);
        prop_assert_eq!(sizes.len(), 1);
    }
}
