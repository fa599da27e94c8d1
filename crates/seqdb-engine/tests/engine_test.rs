//! End-to-end scenarios over the fraction manager: ingest, search, fetch,
//! aggregations, and the active -> sealed equivalence.

mod common;

use rand::{Rng, SeedableRng};

use seqdb_core::qpr::AggFunc;
use seqdb_core::query::{Query, RangeTerm, Term};
use seqdb_core::{DocsOrder, SeqId};
use seqdb_engine::search::{AggQuery, SearchParams};
use seqdb_engine::{FracManager, SearchContext};

use common::*;

fn params(query: Query) -> SearchParams {
    let mut params = SearchParams::new(query);
    params.limit = usize::MAX;
    params
}

async fn search_ids(manager: &std::sync::Arc<FracManager>, query: Query) -> Vec<SeqId> {
    let qpr = manager
        .search(params(query), SearchContext::new())
        .await
        .unwrap();
    assert!(!qpr.has_errors(), "search returned errors: {:?}", qpr.errors);
    qpr.ids.iter().map(|i| i.id).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_basic_search_scenarios() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    // S1: two documents with disjoint fields
    let docs = vec![
        keyword_doc(1_000_000, 1, &[("service", "a"), ("x", "yyyy")]),
        keyword_doc(1_000_001, 2, &[("k8s_pod", "sq"), ("y", "xxxx")]),
    ];
    ingest(&manager, &docs, 10).await;

    for sealed in [false, true] {
        if sealed {
            manager.seal_forced().await;
        }

        let got = search_ids(&manager, Query::token("service", Term::pattern("a"))).await;
        assert_eq!(got, vec![SeqId::new(1_000_000, 1)], "sealed={sealed}");

        let got = search_ids(
            &manager,
            Query::not(Query::token("_exists_", Term::pattern("k8s_pod"))),
        )
        .await;
        assert_eq!(got, vec![SeqId::new(1_000_000, 1)], "sealed={sealed}");

        let got = search_ids(&manager, Query::token("k8s_pod", Term::pattern("sq*"))).await;
        assert_eq!(got, vec![SeqId::new(1_000_001, 2)], "sealed={sealed}");

        // no matches for an unknown value
        let got = search_ids(&manager, Query::token("service", Term::pattern("zzz"))).await;
        assert!(got.is_empty());
    }

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_ingest_strict_order() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    // S2: 16 * 1024 docs with random MIDs; several id blocks after sealing
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let total = 16 * 1024;
    let docs: Vec<_> = (0..total)
        .map(|i| {
            let mid = 1_000_000 + rng.gen_range(0..500_000u64);
            keyword_doc(mid, i as u64 + 1, &[("service", "a")])
        })
        .collect();
    ingest(&manager, &docs, 256).await;

    for sealed in [false, true] {
        if sealed {
            manager.seal_forced().await;
        }

        let got = search_ids(&manager, Query::token("service", Term::pattern("a"))).await;
        assert_eq!(got.len(), total, "sealed={sealed}");
        for window in got.windows(2) {
            assert!(window[0] > window[1], "ids must strictly descend");
        }

        // ascending order mirrors it
        let mut asc = params(Query::token("service", Term::pattern("a")));
        asc.order = DocsOrder::Asc;
        let qpr = manager.search(asc, SearchContext::new()).await.unwrap();
        assert_eq!(qpr.ids.len(), total);
        for window in qpr.ids.windows(2) {
            assert!(window[0].id < window[1].id, "ids must strictly ascend");
        }
    }

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_aggregation_buckets() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    // S3: 777 docs across three services
    let docs: Vec<_> = (0..777)
        .map(|i| {
            keyword_doc(
                2_000_000 + i,
                i + 1,
                &[("service", ["x0", "x1", "x2"][i as usize % 3])],
            )
        })
        .collect();
    ingest(&manager, &docs, 100).await;

    for sealed in [false, true] {
        if sealed {
            manager.seal_forced().await;
        }

        let got = search_ids(&manager, Query::token("service", Term::pattern("x1"))).await;
        assert_eq!(got.len(), 259, "sealed={sealed}");

        let mut p = params(Query::token("service", Term::pattern("x*")));
        p.aggs = vec![AggQuery {
            field: "service".to_string(),
            func: AggFunc::Count,
            quantiles: vec![],
        }];
        p.with_total = true;
        let qpr = manager.search(p, SearchContext::new()).await.unwrap();
        assert_eq!(qpr.total, 777);
        assert_eq!(qpr.aggs.len(), 1);

        let result = qpr.aggs[0].aggregate(AggFunc::Count, &[]);
        assert_eq!(result.buckets.len(), 3, "sealed={sealed}");
        let mut names: Vec<&str> = result.buckets.iter().map(|b| b.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["x0", "x1", "x2"]);
        for bucket in &result.buckets {
            assert_eq!(bucket.value, 259.0);
        }
    }

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_path_tokenizer_hierarchy() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    // S5: hierarchical prefixes match, reordered segments do not
    let docs = vec![path_doc(3_000_000, 1, "request_uri", "/one/two/three")];
    ingest(&manager, &docs, 10).await;

    for sealed in [false, true] {
        if sealed {
            manager.seal_forced().await;
        }

        let got = search_ids(&manager, Query::token("request_uri", Term::pattern("/one/two"))).await;
        assert_eq!(got.len(), 1, "sealed={sealed}");

        let got = search_ids(&manager, Query::token("request_uri", Term::pattern("/two/one"))).await;
        assert!(got.is_empty(), "sealed={sealed}");
    }

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_numeric_range() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    // S6: numeric comparison must exclude 127 despite lexicographic order
    let levels = [0u64, 1, 3, 7, 15, 31, 63, 127];
    let docs: Vec<_> = levels
        .iter()
        .enumerate()
        .map(|(i, &level)| {
            keyword_doc(
                4_000_000 + i as u64,
                i as u64 + 1,
                &[("level", level.to_string().as_str())],
            )
        })
        .collect();
    ingest(&manager, &docs, 10).await;

    for sealed in [false, true] {
        if sealed {
            manager.seal_forced().await;
        }
        let got = search_ids(
            &manager,
            Query::token("level", Term::Range(RangeTerm::closed("0", "63"))),
        )
        .await;
        assert_eq!(got.len(), 7, "sealed={sealed}");
    }

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    let docs: Vec<_> = (0..500u64)
        .map(|i| keyword_doc(5_000_000 + i, i + 1, &[("n", i.to_string().as_str())]))
        .collect();
    let expected: Vec<(SeqId, Vec<u8>)> =
        docs.iter().map(|d| (d.id, d.body.clone())).collect();
    ingest(&manager, &docs, 64).await;

    for sealed in [false, true] {
        if sealed {
            manager.seal_forced().await;
        }

        let ids: Vec<SeqId> = expected.iter().map(|(id, _)| *id).collect();
        let fetched = manager.fetch(ids, SearchContext::new()).await.unwrap();
        for ((id, body), fetched) in expected.iter().zip(&fetched) {
            assert_eq!(fetched, body, "payload mismatch for {id}, sealed={sealed}");
        }

        // unknown ids come back empty, in position
        let fetched = manager
            .fetch(
                vec![SeqId::new(1, 1), expected[7].0],
                SearchContext::new(),
            )
            .await
            .unwrap();
        assert!(fetched[0].is_empty());
        assert_eq!(fetched[1], expected[7].1);
    }

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_boolean_operators() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    let docs = vec![
        keyword_doc(100, 1, &[("service", "a"), ("level", "error")]),
        keyword_doc(200, 2, &[("service", "a"), ("level", "info")]),
        keyword_doc(300, 3, &[("service", "b"), ("level", "error")]),
    ];
    ingest(&manager, &docs, 10).await;

    for sealed in [false, true] {
        if sealed {
            manager.seal_forced().await;
        }

        let got = search_ids(
            &manager,
            Query::and(
                Query::token("service", Term::pattern("a")),
                Query::token("level", Term::pattern("error")),
            ),
        )
        .await;
        assert_eq!(got, vec![SeqId::new(100, 1)], "sealed={sealed}");

        let got = search_ids(
            &manager,
            Query::or(
                Query::token("service", Term::pattern("b")),
                Query::token("level", Term::pattern("info")),
            ),
        )
        .await;
        assert_eq!(got, vec![SeqId::new(300, 3), SeqId::new(200, 2)]);

        let got = search_ids(
            &manager,
            Query::and(
                Query::token("service", Term::pattern("a")),
                Query::not(Query::token("level", Term::pattern("error"))),
            ),
        )
        .await;
        assert_eq!(got, vec![SeqId::new(200, 2)]);
    }

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_time_range_and_histogram() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    let docs: Vec<_> = (0..100u64)
        .map(|i| keyword_doc(10_000 + i * 100, i + 1, &[("k", "v")]))
        .collect();
    ingest(&manager, &docs, 25).await;

    for sealed in [false, true] {
        if sealed {
            manager.seal_forced().await;
        }

        let mut p = params(Query::token("k", Term::pattern("v")));
        p.from = 12_000;
        p.to = 15_000;
        let qpr = manager.search(p.clone(), SearchContext::new()).await.unwrap();
        // mids 12000..=15000 step 100
        assert_eq!(qpr.ids.len(), 31, "sealed={sealed}");
        assert!(qpr.ids.iter().all(|i| i.id.mid >= 12_000 && i.id.mid <= 15_000));

        p.hist_interval = 1_000;
        let qpr = manager.search(p, SearchContext::new()).await.unwrap();
        let total_in_hist: u64 = qpr.histogram.values().sum();
        assert_eq!(total_in_hist, 31);
        assert_eq!(qpr.histogram[&12_000], 10);
    }

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_limit_and_total() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    let docs: Vec<_> = (0..50u64)
        .map(|i| keyword_doc(1000 + i, i + 1, &[("k", "v")]))
        .collect();
    ingest(&manager, &docs, 10).await;
    manager.seal_forced().await;

    let mut p = params(Query::token("k", Term::pattern("v")));
    p.limit = 5;
    let qpr = manager.search(p.clone(), SearchContext::new()).await.unwrap();
    assert_eq!(qpr.ids.len(), 5);
    assert_eq!(qpr.ids[0].id.mid, 1049);

    p.with_total = true;
    let qpr = manager.search(p, SearchContext::new()).await.unwrap();
    assert_eq!(qpr.ids.len(), 5);
    assert_eq!(qpr.total, 50);

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_canceled_search() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    let docs: Vec<_> = (0..100u64)
        .map(|i| keyword_doc(1000 + i, i + 1, &[("k", "v")]))
        .collect();
    ingest(&manager, &docs, 10).await;

    let ctx = SearchContext::new();
    ctx.cancel();
    let result = manager
        .search(params(Query::token("k", Term::pattern("v"))), ctx)
        .await;
    assert!(matches!(result, Err(seqdb_core::Error::Canceled)));

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_posting_list_spills_lid_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    // one token shared by more documents than a single LID block holds
    // (64 Ki entries), forcing continued blocks in the sealed layout
    let total = 70_000usize;
    let docs: Vec<_> = (0..total as u64)
        .map(|i| keyword_doc(1_000_000 + i, i + 1, &[("service", "busy")]))
        .collect();
    ingest(&manager, &docs, 1_000).await;
    manager.seal_forced().await;

    let got = search_ids(&manager, Query::token("service", Term::pattern("busy"))).await;
    assert_eq!(got.len(), total);
    for window in got.windows(2) {
        assert!(window[0] > window[1], "ids must strictly descend");
    }

    let mut asc = params(Query::token("service", Term::pattern("busy")));
    asc.order = DocsOrder::Asc;
    asc.limit = 10;
    let qpr = manager.search(asc, SearchContext::new()).await.unwrap();
    let mids: Vec<u64> = qpr.ids.iter().map(|i| i.id.mid).collect();
    assert_eq!(mids, (1_000_000..1_000_010).collect::<Vec<_>>());

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_across_multiple_fractions() {
    let dir = tempfile::tempdir().unwrap();
    let manager = start_manager(test_config(dir.path())).await;

    // three sealed fractions plus a live active one
    for round in 0u64..4 {
        let docs: Vec<_> = (0..20u64)
            .map(|i| {
                keyword_doc(
                    100_000 + round * 1_000 + i,
                    round * 100 + i + 1,
                    &[("k", "v")],
                )
            })
            .collect();
        ingest(&manager, &docs, 10).await;
        if round < 3 {
            manager.seal_forced().await;
        }
    }

    let got = search_ids(&manager, Query::token("k", Term::pattern("v"))).await;
    assert_eq!(got.len(), 80);
    for window in got.windows(2) {
        assert!(window[0] > window[1]);
    }

    manager.stop().await;
}
