use async_trait::async_trait;
use proptest::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use channel_resolver::{
    config::EngineConfig,
    errors::ProbeResult,
    matching::{LogoHash, LogoSimilarity},
    models::{MergeMethod, MergeRule, RawChannelEntry, Region, Resolution, Variant},
    registry::ChannelRegistry,
    sync::SyncEngine,
};

/// Every logo hashes the same, so any logo comparison is a perfect match
struct IdenticalLogos;

#[async_trait]
impl LogoSimilarity for IdenticalLogos {
    async fn logo_hash(&self, _logo_url: &str) -> ProbeResult<LogoHash> {
        Ok(LogoHash(0x00ff_00ff_00ff_00ff))
    }
}

fn registry() -> ChannelRegistry {
    ChannelRegistry::new(&EngineConfig::default()).unwrap()
}

fn entry(provider: &str, name: &str, url: &str) -> RawChannelEntry {
    RawChannelEntry::new(provider, name, url)
}

#[tokio::test]
async fn test_three_providers_merge_and_rank_by_resolution() {
    let registry = registry();

    let (hd, _) = registry
        .resolve(&entry("p1", "CNN HD", "http://one.example/cnn"))
        .await
        .unwrap();
    let (uhd, _) = registry
        .resolve(&entry("p2", "US: CNN 4K", "http://two.example/cnn"))
        .await
        .unwrap();
    let (plain, _) = registry
        .resolve(&entry("p3", "CNN", "http://three.example/cnn"))
        .await
        .unwrap();

    assert_eq!(hd, uhd);
    assert_eq!(hd, plain);

    let view = registry.ranked_view(hd).await.unwrap();
    assert_eq!(view.canonical_name, "CNN");
    assert_eq!(view.streams.len(), 3);

    let providers: Vec<&str> = view.streams.iter().map(|s| s.provider_id.as_str()).collect();
    assert_eq!(providers, vec!["p2", "p1", "p3"]);

    let resolutions: Vec<Resolution> = view.streams.iter().map(|s| s.resolution).collect();
    assert_eq!(
        resolutions,
        vec![Resolution::Uhd2160, Resolution::Hd720, Resolution::Unknown]
    );

    let ranks: Vec<u32> = view.streams.iter().map(|s| s.priority_rank).collect();
    assert_eq!(ranks, vec![0, 1, 2]);
    assert_eq!(view.quality_score, 1000);

    let primary = registry.primary_stream(hd).await.unwrap().unwrap();
    assert_eq!(primary.provider_id, "p2");
}

#[tokio::test]
async fn test_regions_never_merge() {
    let registry = registry();

    let (east, _) = registry
        .resolve(&entry("p1", "Sportsnet East", "http://one.example/sn-east"))
        .await
        .unwrap();
    let (west, decision) = registry
        .resolve(&entry("p1", "Sportsnet West", "http://one.example/sn-west"))
        .await
        .unwrap();

    assert_ne!(east, west);
    assert_eq!(decision.method, MergeMethod::NoMatch);
    assert_eq!(decision.confidence, 0.0);

    let east = registry.channel(east).await.unwrap();
    let west = registry.channel(west).await.unwrap();
    assert_eq!(east.region(), Some(Region::East));
    assert_eq!(west.region(), Some(Region::West));
    assert_eq!(east.key.base_name, west.key.base_name);
}

#[tokio::test]
async fn test_variants_never_merge() {
    let registry = registry();

    let (espn, _) = registry
        .resolve(&entry("p1", "ESPN", "http://one.example/espn"))
        .await
        .unwrap();
    let (plus, _) = registry
        .resolve(&entry("p2", "ESPN+", "http://two.example/espn-plus"))
        .await
        .unwrap();

    assert_ne!(espn, plus);
    assert_eq!(
        registry.channel(plus).await.unwrap().variant(),
        Some(Variant::Plus)
    );
    assert_eq!(registry.channel(espn).await.unwrap().variant(), None);
}

#[tokio::test]
async fn test_fuzzy_match_merges_misspelling() {
    let registry = registry();

    let (original, _) = registry
        .resolve(&entry("p1", "Discovery Channel", "http://one.example/disc"))
        .await
        .unwrap();
    let (typo, decision) = registry
        .resolve(&entry("p2", "Discovery Chanel", "http://two.example/disc"))
        .await
        .unwrap();

    assert_eq!(original, typo);
    assert_eq!(decision.method, MergeMethod::Fuzzy);
    assert!(decision.confidence >= 85.0 && decision.confidence < 100.0);
    assert_eq!(decision.candidates.len(), 1);
}

#[tokio::test]
async fn test_never_merge_rule_vetoes_fuzzy_match() {
    let registry = registry();
    registry
        .add_merge_rule(MergeRule::never_merge("chanel", "^discovery channel$"))
        .await
        .unwrap();

    let (original, _) = registry
        .resolve(&entry("p1", "Discovery Channel", "http://one.example/disc"))
        .await
        .unwrap();
    let (typo, decision) = registry
        .resolve(&entry("p2", "Discovery Chanel", "http://two.example/disc"))
        .await
        .unwrap();

    assert_ne!(original, typo);
    assert_eq!(decision.method, MergeMethod::NoMatch);
}

#[tokio::test]
async fn test_logo_match_when_names_differ() {
    let registry = registry().with_logo_similarity(Arc::new(IdenticalLogos));

    let (natgeo, _) = registry
        .resolve(
            &entry("p1", "National Geographic", "http://one.example/ng")
                .with_logo("http://logos.example/ng.png"),
        )
        .await
        .unwrap();
    let (short, decision) = registry
        .resolve(
            &entry("p2", "Nat Geo", "http://two.example/ng")
                .with_logo("http://logos.example/natgeo.png"),
        )
        .await
        .unwrap();

    assert_eq!(natgeo, short);
    assert_eq!(decision.method, MergeMethod::Logo);
    assert_eq!(decision.confidence, 100.0);
}

#[tokio::test]
async fn test_logo_match_requires_logo() {
    let registry = registry().with_logo_similarity(Arc::new(IdenticalLogos));

    let (natgeo, _) = registry
        .resolve(
            &entry("p1", "National Geographic", "http://one.example/ng")
                .with_logo("http://logos.example/ng.png"),
        )
        .await
        .unwrap();
    let (short, _) = registry
        .resolve(&entry("p2", "Nat Geo", "http://two.example/ng"))
        .await
        .unwrap();

    assert_ne!(natgeo, short);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_syncs_create_one_channel() {
    let config = EngineConfig::default();
    let registry = Arc::new(ChannelRegistry::new(&config).unwrap());
    let first = SyncEngine::new(registry.clone(), config.clone());
    let second = SyncEngine::new(registry.clone(), config);
    let cancel = CancellationToken::new();

    let a = vec![entry("p1", "TSN Atlantic", "http://one.example/tsn-atl")];
    let b = vec![entry("p2", "TSN Atlantic HD", "http://two.example/tsn-atl")];

    let (ra, rb) = tokio::join!(
        first.sync_provider("p1", &a, &cancel),
        second.sync_provider("p2", &b, &cancel)
    );
    let created = ra.unwrap().channels_created + rb.unwrap().channels_created;
    assert_eq!(created, 1);

    let channels = registry.channels().await;
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].stream_count(), 2);
    assert_eq!(channels[0].region(), Some(Region::Atlantic));
}

#[tokio::test]
async fn test_same_input_gives_same_assignments() {
    let batch = vec![
        entry("p1", "CNN HD", "http://one.example/cnn"),
        entry("p1", "BBC One", "http://one.example/bbc1"),
        entry("p1", "Sportsnet East", "http://one.example/sn-east"),
        entry("p2", "CNN", "http://two.example/cnn"),
        entry("p2", "BBC 1ne", "http://two.example/bbc1"),
        entry("p2", "TSN 2", "http://two.example/tsn2"),
    ];

    let mut runs = Vec::new();
    for _ in 0..2 {
        let registry = registry();
        for e in &batch {
            registry.resolve(e).await.unwrap();
        }
        runs.push(registry.ranked_views().await);
    }

    assert_eq!(runs[0], runs[1]);
    assert!(!runs[0].is_empty());
}

#[tokio::test]
async fn test_manual_split_survives_resync() {
    let config = EngineConfig::default();
    let registry = Arc::new(ChannelRegistry::new(&config).unwrap());
    let engine = SyncEngine::new(registry.clone(), config);
    let cancel = CancellationToken::new();

    let batch = vec![
        entry("p1", "Global", "http://one.example/global"),
        entry("p1", "Global HD", "http://one.example/global-bc"),
    ];
    engine.sync_provider("p1", &batch, &cancel).await.unwrap();

    let channel = registry.channels().await.remove(0);
    assert_eq!(channel.stream_count(), 2);

    let (_, moved) = registry.resolve(&batch[1]).await.unwrap();
    let split = registry
        .split(channel.id, &[moved.stream_id], Some("Global BC"))
        .await
        .unwrap();

    let report = engine.sync_provider("p1", &batch, &cancel).await.unwrap();
    assert_eq!(report.refreshed, 2);
    assert_eq!(report.channels_created, 0);

    let stream = registry.stream(moved.stream_id).await.unwrap();
    assert_eq!(stream.channel_id, split);

    let trail = registry.decisions(split).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].method, MergeMethod::Manual);
}

#[tokio::test]
async fn test_resync_under_new_region_leaves_old_channel() {
    let config = EngineConfig::default();
    let registry = Arc::new(ChannelRegistry::new(&config).unwrap());
    let engine = SyncEngine::new(registry.clone(), config);
    let cancel = CancellationToken::new();

    engine
        .sync_provider("p1", &[entry("p1", "Sportsnet East", "http://one.example/sn")], &cancel)
        .await
        .unwrap();
    let before = vec![entry("p2", "Sportsnet East", "http://two.example/sn")];
    engine.sync_provider("p2", &before, &cancel).await.unwrap();
    assert_eq!(registry.channels().await.len(), 1);

    let after = vec![entry("p2", "Sportsnet West", "http://two.example/sn")];
    let report = engine.sync_provider("p2", &after, &cancel).await.unwrap();
    assert_eq!(report.channels_created, 1);

    for channel in registry.channels().await {
        let view = registry.ranked_view(channel.id).await.unwrap();
        let mut names = Vec::new();
        for stream in &view.streams {
            let record = registry.stream(stream.stream_id).await.unwrap();
            names.push(record.original_name);
        }
        match channel.region() {
            Some(Region::East) => assert_eq!(names, vec!["Sportsnet East"]),
            Some(Region::West) => assert_eq!(names, vec!["Sportsnet West"]),
            other => panic!("unexpected region {other:?}"),
        }
    }
}

/// Labels for one channel, best quality first; the last one is below all others
const CNN_LABELS: [&str; 5] = ["CNN 4K", "CNN FHD", "CNN HD", "CNN SD", "CNN"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_lower_quality_stream_keeps_existing_order(
        existing in prop::collection::vec((0usize..4, -2i32..3), 1..8),
        priority in -2i32..3,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let registry = registry();
            let mut channel = None;
            for (i, (label, p)) in existing.iter().enumerate() {
                let e = entry(&format!("p{i}"), CNN_LABELS[*label], &format!("http://p{i}.example/live"))
                    .with_priority(*p);
                channel = Some(registry.resolve(&e).await.unwrap().0);
            }
            let channel = channel.unwrap();
            let before: Vec<_> = registry
                .ranked_view(channel)
                .await
                .unwrap()
                .streams
                .into_iter()
                .map(|s| s.stream_id)
                .collect();

            let newcomer = entry("late", CNN_LABELS[4], "http://late.example/live").with_priority(priority);
            let (joined, decision) = registry.resolve(&newcomer).await.unwrap();
            prop_assert_eq!(joined, channel);

            let after: Vec<_> = registry
                .ranked_view(channel)
                .await
                .unwrap()
                .streams
                .into_iter()
                .map(|s| s.stream_id)
                .collect();
            prop_assert_eq!(after.len(), before.len() + 1);
            prop_assert_eq!(after.last(), Some(&decision.stream_id));
            let kept: Vec<_> = after
                .into_iter()
                .filter(|id| *id != decision.stream_id)
                .collect();
            prop_assert_eq!(kept, before);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
