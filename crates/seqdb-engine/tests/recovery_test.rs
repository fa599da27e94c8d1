//! Crash-recovery and retention scenarios: `.del` markers, sealing tmp
//! files, partial append tails, restart classification, and size-based
//! eviction.

mod common;

use seqdb_core::query::{Query, Term};
use seqdb_core::SeqId;
use seqdb_engine::frac::sealed::PartialSuicide;
use seqdb_engine::frac::Frac;
use seqdb_engine::{SearchContext, SearchParams};

use common::*;

fn list_dir(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

async fn count_hits(manager: &std::sync::Arc<seqdb_engine::FracManager>, value: &str) -> usize {
    let mut params = SearchParams::new(Query::token("k", Term::pattern(value)));
    params.limit = usize::MAX;
    manager
        .search(params, SearchContext::new())
        .await
        .unwrap()
        .ids
        .len()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_preserves_sealed_and_active() {
    let dir = tempfile::tempdir().unwrap();

    {
        let manager = start_manager(test_config(dir.path())).await;
        let docs: Vec<_> = (0..30u64)
            .map(|i| keyword_doc(1000 + i, i + 1, &[("k", "sealedv")]))
            .collect();
        ingest(&manager, &docs, 10).await;
        manager.seal_forced().await;

        let docs: Vec<_> = (0..10u64)
            .map(|i| keyword_doc(2000 + i, 100 + i, &[("k", "activev")]))
            .collect();
        ingest(&manager, &docs, 10).await;
        // leave the active unsealed: it is small
        manager.stop().await;
    }

    let manager = start_manager(test_config(dir.path())).await;
    assert_eq!(count_hits(&manager, "sealedv").await, 30);
    assert_eq!(count_hits(&manager, "activev").await, 10);

    // fetch works across the restart too
    let fetched = manager
        .fetch(vec![SeqId::new(2000, 100)], SearchContext::new())
        .await
        .unwrap();
    assert!(!fetched[0].is_empty());

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_del_markers_finished_on_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let manager = start_manager(test_config(dir.path())).await;
        let docs: Vec<_> = (0..20u64)
            .map(|i| keyword_doc(1000 + i, i + 1, &[("k", "v")]))
            .collect();
        ingest(&manager, &docs, 10).await;
        manager.seal_forced().await;
        manager.stop().await;
    }

    // interrupt a suicide halfway through the renames
    let base = list_dir(dir.path())
        .iter()
        .find(|n| n.ends_with(".index"))
        .unwrap()
        .trim_end_matches(".index")
        .to_string();
    {
        let manager = start_manager(test_config(dir.path())).await;
        for frac in manager.fracs() {
            if let Frac::Sealed(sealed) = &frac {
                if sealed.info().name() == base {
                    sealed.set_partial_suicide(PartialSuicide::HalfRename);
                    sealed.suicide();
                }
            }
        }
        manager.stop().await;
    }
    assert!(
        list_dir(dir.path()).iter().any(|n| n.ends_with(".del")),
        "expected a leftover .del marker"
    );

    // restart completes the deletion
    let manager = start_manager(test_config(dir.path())).await;
    let names = list_dir(dir.path());
    assert!(
        !names.iter().any(|n| n.starts_with(&base)),
        "fraction files must be gone, found {names:?}"
    );
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_half_remove_finished_on_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let manager = start_manager(test_config(dir.path())).await;
        let docs: Vec<_> = (0..20u64)
            .map(|i| keyword_doc(1000 + i, i + 1, &[("k", "v")]))
            .collect();
        ingest(&manager, &docs, 10).await;
        manager.seal_forced().await;

        for frac in manager.fracs() {
            if let Frac::Sealed(sealed) = &frac {
                sealed.set_partial_suicide(PartialSuicide::HalfRemove);
                sealed.suicide();
            }
        }
        manager.stop().await;
    }

    let manager = start_manager(test_config(dir.path())).await;
    assert!(
        !list_dir(dir.path()).iter().any(|n| n.contains(".del")),
        "all .del files must be cleaned up"
    );
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sealing_tmp_files_removed_on_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let manager = start_manager(test_config(dir.path())).await;
        let docs: Vec<_> = (0..5u64)
            .map(|i| keyword_doc(1000 + i, i + 1, &[("k", "v")]))
            .collect();
        ingest(&manager, &docs, 10).await;
        manager.stop().await;
    }

    // fake an interrupted seal
    std::fs::write(dir.path().join("seq-db-0FAKE._index"), b"partial").unwrap();
    std::fs::write(dir.path().join("seq-db-0FAKE._sdocs"), b"partial").unwrap();

    let manager = start_manager(test_config(dir.path())).await;
    let names = list_dir(dir.path());
    assert!(!names.iter().any(|n| n.contains("._index")));
    assert!(!names.iter().any(|n| n.contains("._sdocs")));
    assert_eq!(count_hits(&manager, "v").await, 5);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_meta_tail_truncated_on_restart() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    {
        let manager = start_manager(test_config(dir.path())).await;
        let docs: Vec<_> = (0..8u64)
            .map(|i| keyword_doc(1000 + i, i + 1, &[("k", "v")]))
            .collect();
        ingest(&manager, &docs, 4).await;
        manager.stop().await;
    }

    // torn write at the end of the meta file
    let meta_name = list_dir(dir.path())
        .into_iter()
        .find(|n| n.ends_with(".meta"))
        .expect("active fraction must keep its meta file");
    let meta_path = dir.path().join(meta_name);
    let clean_len = std::fs::metadata(&meta_path).unwrap().len();
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&meta_path)
        .unwrap();
    file.write_all(&[0xDE; 21]).unwrap();
    drop(file);

    let manager = start_manager(test_config(dir.path())).await;
    assert_eq!(count_hits(&manager, "v").await, 8);
    assert_eq!(std::fs::metadata(&meta_path).unwrap().len(), clean_len);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_active_suicided_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = start_manager(test_config(dir.path())).await;
        // no appends at all
        manager.stop().await;
    }
    let before = list_dir(dir.path());
    assert!(before.iter().any(|n| n.ends_with(".meta")));

    let manager = start_manager(test_config(dir.path())).await;
    // the old empty active is gone; a fresh one exists
    let metas: Vec<String> = list_dir(dir.path())
        .into_iter()
        .filter(|n| n.ends_with(".meta"))
        .collect();
    assert_eq!(metas.len(), 1);
    assert!(!before.contains(&metas[0]));
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retention_evicts_oldest() {
    use rand::{Rng, SeedableRng};

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.frac_size = 8 * 1024;
    config.total_size = 32 * 1024;
    let manager = start_manager(config.clone()).await;
    manager.start();

    assert!(!manager.mature());
    assert!(dir.path().join(".immature").exists());

    // keep appending until rotation + eviction must have fired; the padding
    // is random so compression cannot collapse the docs blocks
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut rid = 0u64;
    for round in 0..40u64 {
        let docs: Vec<_> = (0..16u64)
            .map(|i| {
                rid += 1;
                let pad: String = (0..256)
                    .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
                    .collect();
                keyword_doc(
                    1_000_000 + round * 100 + i,
                    rid,
                    &[("k", format!("value-{round}-{i}").as_str()), ("pad", pad.as_str())],
                )
            })
            .collect();
        ingest(&manager, &docs, 4).await;
        manager.maintenance_forced().await;
    }

    let fracs = manager.fracs();
    let total: u64 = fracs.iter().map(|f| f.info().full_size()).sum();
    assert!(
        total <= config.total_size + config.frac_size,
        "retention must bound total size: {total}"
    );
    assert!(manager.mature(), "eviction must clear the immature flag");
    assert!(!dir.path().join(".immature").exists());

    manager.stop().await;
}
